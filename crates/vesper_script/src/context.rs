// Execution Context - Per-invocation state passed to every block
//
// A fresh context is created for each trigger. Nothing here is shared
// between invocations except the console capability.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::unit::{BlockTable, Executable};

/// Maximum nesting of `call` statements within one invocation
pub const MAX_CALL_DEPTH: usize = 64;

// ─────────────────────────────────────────────────────────────────────────────
// Console
// ─────────────────────────────────────────────────────────────────────────────

/// Side-effecting output used by `print`
pub trait Console: Send + Sync {
    fn print(&self, line: &str);
}

/// Console that writes to stdout
#[derive(Debug, Default, Clone, Copy)]
pub struct StdConsole;

impl Console for StdConsole {
    fn print(&self, line: &str) {
        println!("{line}");
    }
}

/// Console that records every printed line
#[derive(Debug, Default)]
pub struct CapturedConsole {
    lines: Mutex<Vec<String>>,
}

impl CapturedConsole {
    /// Snapshot of the lines printed so far
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Drop all recorded lines
    pub fn clear(&self) {
        self.lines.lock().clear();
    }
}

impl Console for CapturedConsole {
    fn print(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Script Context
// ─────────────────────────────────────────────────────────────────────────────

/// State for a single invocation of a compiled unit
pub struct ScriptContext {
    variables: HashMap<String, Value>,
    event: Option<Value>,
    console: Arc<dyn Console>,
    blocks: Option<Arc<BlockTable>>,
    depth: usize,
}

impl ScriptContext {
    /// Create an empty context
    pub fn new(console: Arc<dyn Console>) -> Self {
        Self {
            variables: HashMap::new(),
            event: None,
            console,
            blocks: None,
            depth: 0,
        }
    }

    /// Attach the payload of the trigger that started this invocation
    pub fn with_event(mut self, event: Value) -> Self {
        self.event = Some(event);
        self
    }

    /// Seed a variable
    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    /// Trigger payload, if any
    pub fn event(&self) -> Option<&Value> {
        self.event.as_ref()
    }

    /// Get a variable value
    pub fn get_variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Set a variable value
    pub fn set_variable(&mut self, name: &str, value: Value) {
        self.variables.insert(name.to_string(), value);
    }

    /// Remove a variable, returning its previous value
    pub fn remove_variable(&mut self, name: &str) -> Option<Value> {
        self.variables.remove(name)
    }

    pub fn console(&self) -> &Arc<dyn Console> {
        &self.console
    }

    /// Print a line through the console
    pub fn print(&self, line: &str) {
        self.console.print(line);
    }

    /// Look up a routine of the unit currently being invoked
    pub fn routine(&self, name: &str) -> Option<Arc<dyn Executable>> {
        self.blocks.as_ref().and_then(|b| b.get(name).cloned())
    }

    pub(crate) fn install_blocks(&mut self, blocks: Arc<BlockTable>) -> Option<Arc<BlockTable>> {
        self.blocks.replace(blocks)
    }

    pub(crate) fn restore_blocks(&mut self, previous: Option<Arc<BlockTable>>) {
        self.blocks = previous;
    }

    /// Enter a nested call; returns false once the depth limit is reached
    pub(crate) fn enter_call(&mut self) -> bool {
        if self.depth >= MAX_CALL_DEPTH {
            return false;
        }
        self.depth += 1;
        true
    }

    pub(crate) fn leave_call(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub(crate) fn depth(&self) -> usize {
        self.depth
    }
}

/// Render a value the way `print` shows it
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Truthiness used by conditions
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
