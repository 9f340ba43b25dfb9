//! Script Assembler
//!
//! Turns configuration fragments into one routine. Control flow is injected
//! as a small tree of fragments and only rendered to text at the end:
//!
//! ```text
//! def handler_<hash> = {
//!     if { <condition> } then {
//!         try { <handle> } catch with "<matcher>" { <handler> }
//!     } else {
//!         <deny>
//!     }
//! }
//! ```

use std::fmt::Write;

/// Indentation unit used when rendering nested fragments
const INDENT: &str = "    ";

/// Statement emitted in place of an empty body
pub const NULL_STATEMENT: &str = "null";

/// One `catch` arm: an error matcher and the fragment run when it matches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionClause {
    pub matcher: String,
    pub handler: String,
}

impl ExceptionClause {
    pub fn new(matcher: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            matcher: matcher.into(),
            handler: handler.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Fragment Tree
// ─────────────────────────────────────────────────────────────────────────────

/// A piece of generated source
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    /// Raw script text
    Literal(String),
    /// Body protected by one guarded arm per clause
    Guarded {
        body: Box<Fragment>,
        clauses: Vec<ExceptionClause>,
    },
    /// Body run only when `condition` holds, `deny` otherwise
    Conditional {
        condition: String,
        body: Box<Fragment>,
        deny: String,
    },
    /// Named top-level routine
    Routine { name: String, body: Box<Fragment> },
}

impl Fragment {
    /// Wrap in a guarded block
    pub fn guarded(self, clauses: Vec<ExceptionClause>) -> Self {
        Fragment::Guarded {
            body: Box::new(self),
            clauses,
        }
    }

    /// Wrap in a conditional
    pub fn conditional(self, condition: impl Into<String>, deny: impl Into<String>) -> Self {
        Fragment::Conditional {
            condition: condition.into(),
            body: Box::new(self),
            deny: deny.into(),
        }
    }

    /// Wrap in a named routine
    pub fn routine(self, name: impl Into<String>) -> Self {
        Fragment::Routine {
            name: name.into(),
            body: Box::new(self),
        }
    }

    /// Render to source text
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        match self {
            Fragment::Literal(text) => push_text(out, text, depth),
            Fragment::Guarded { body, clauses } => {
                push_line(out, "try {", depth);
                body.render_into(out, depth + 1);
                for clause in clauses {
                    push_line(
                        out,
                        &format!("}} catch with {} {{", quote(&clause.matcher)),
                        depth,
                    );
                    push_text(out, &clause.handler, depth + 1);
                }
                push_line(out, "}", depth);
            }
            Fragment::Conditional {
                condition,
                body,
                deny,
            } => {
                push_line(out, "if {", depth);
                push_text(out, condition, depth + 1);
                push_line(out, "} then {", depth);
                body.render_into(out, depth + 1);
                push_line(out, "} else {", depth);
                push_text(out, deny, depth + 1);
                push_line(out, "}", depth);
            }
            Fragment::Routine { name, body } => {
                push_line(out, &format!("def {name} = {{"), depth);
                body.render_into(out, depth + 1);
                push_line(out, "}", depth);
            }
        }
    }
}

fn push_line(out: &mut String, line: &str, depth: usize) {
    for _ in 0..depth {
        out.push_str(INDENT);
    }
    out.push_str(line);
    out.push('\n');
}

/// Push every line of `text`, substituting a null statement for blank text
fn push_text(out: &mut String, text: &str, depth: usize) {
    if text.trim().is_empty() {
        push_line(out, NULL_STATEMENT, depth);
        return;
    }
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        push_line(out, line.trim_end(), depth);
    }
}

/// Quote a matcher as a string literal
fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Assembly
// ─────────────────────────────────────────────────────────────────────────────

/// Whether the clauses warrant a guarded block.
///
/// A lone clause with an empty handler is treated as absent.
pub fn needs_guard(clauses: &[ExceptionClause]) -> bool {
    match clauses {
        [] => false,
        [only] => !only.handler.trim().is_empty(),
        _ => true,
    }
}

/// Build the fragment tree for a handler routine
pub fn build(
    entry: &str,
    handle: &str,
    condition: &str,
    deny: &str,
    clauses: &[ExceptionClause],
) -> Fragment {
    let handle = if handle.trim().is_empty() {
        NULL_STATEMENT
    } else {
        handle
    };
    let mut fragment = Fragment::Literal(handle.to_string());

    if needs_guard(clauses) {
        fragment = fragment.guarded(clauses.to_vec());
    }

    if !condition.trim().is_empty() {
        fragment = fragment.conditional(condition, deny);
    }

    fragment.routine(entry)
}

/// Assemble a handler routine and render it with comments stripped
pub fn assemble(
    entry: &str,
    handle: &str,
    condition: &str,
    deny: &str,
    clauses: &[ExceptionClause],
) -> String {
    strip_comments(&build(entry, handle, condition, deny, clauses).render())
}

/// Wrap raw statements in a named routine without any injected control flow
pub fn routine(entry: &str, body: &str) -> String {
    strip_comments(&Fragment::Literal(body.to_string()).routine(entry).render())
}

/// Remove `// line` and `/* block */` comments outside string literals.
///
/// Lines left blank by the removal are dropped.
pub fn strip_comments(source: &str) -> String {
    let mut stripped = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            stripped.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match (c, chars.peek()) {
            ('"', _) => {
                in_string = true;
                stripped.push(c);
            }
            ('/', Some('/')) => {
                while chars.peek().is_some_and(|&n| n != '\n') {
                    chars.next();
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for n in chars.by_ref() {
                    if prev == '*' && n == '/' {
                        break;
                    }
                    // keep line structure so diagnostics still point at the right line
                    if n == '\n' {
                        stripped.push('\n');
                    }
                    prev = n;
                }
            }
            _ => stripped.push(c),
        }
    }

    let mut out = String::with_capacity(stripped.len());
    for line in stripped.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let _ = writeln!(out, "{}", line.trim_end());
    }
    out
}
