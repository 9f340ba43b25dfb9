// Lexer - Splits statement DSL source into tokens
//
// Whitespace separates tokens; newlines carry no meaning. Comments are not
// understood here, the assembler strips them before compilation.

use crate::unit::CompileError;

/// Token kinds of the statement DSL
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Bare word: keywords, action names, routine names
    Word(String),
    /// `"quoted"`, `*"starred"` or `*word`
    Text(String),
    Integer(i64),
    Float(f64),
    /// `&name`
    Variable(String),
    LBrace,
    RBrace,
    Equals,
    Eof,
}

/// A token with its 1-based source position
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
}

/// Tokenize a whole source body
pub fn tokenize(source: &str) -> Result<Vec<Token>, CompileError> {
    let mut lexer = Lexer {
        chars: source.chars().peekable(),
        line: 1,
        column: 1,
    };
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token()?;
        let done = token.kind == TokenKind::Eof;
        tokens.push(token);
        if done {
            return Ok(tokens);
        }
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':' | '$')
}

impl Lexer<'_> {
    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(&self, line: usize, column: usize, message: impl Into<String>) -> CompileError {
        CompileError::Syntax {
            line,
            column,
            message: message.into(),
        }
    }

    fn next_token(&mut self) -> Result<Token, CompileError> {
        while self.chars.peek().is_some_and(|c| c.is_whitespace()) {
            self.bump();
        }

        let (line, column) = (self.line, self.column);
        let token = |kind| Token { kind, line, column };

        let Some(c) = self.bump() else {
            return Ok(token(TokenKind::Eof));
        };

        let kind = match c {
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            '=' => TokenKind::Equals,
            '"' => TokenKind::Text(self.quoted(line, column)?),
            '*' => match self.chars.peek() {
                Some('"') => {
                    self.bump();
                    TokenKind::Text(self.quoted(line, column)?)
                }
                Some(&n) if is_word_char(n) => TokenKind::Text(self.word(String::new())),
                _ => return Err(self.error(line, column, "expected text after '*'")),
            },
            '&' => {
                let name = self.word(String::new());
                if name.is_empty() {
                    return Err(self.error(line, column, "expected variable name after '&'"));
                }
                TokenKind::Variable(name)
            }
            '<' => {
                // `<word>` is an alternate spelling of a bare word
                let inner = self.word(String::new());
                if inner.is_empty() || self.bump() != Some('>') {
                    return Err(self.error(line, column, "unterminated '<...>'"));
                }
                TokenKind::Word(inner)
            }
            c if c.is_ascii_digit() || (c == '-' && self.peek_digit()) => {
                self.number(c, line, column)?
            }
            c if is_word_char(c) => {
                let mut start = String::new();
                start.push(c);
                TokenKind::Word(self.word(start))
            }
            other => {
                return Err(self.error(line, column, format!("unexpected character '{other}'")));
            }
        };

        Ok(token(kind))
    }

    fn peek_digit(&mut self) -> bool {
        self.chars.peek().is_some_and(|c| c.is_ascii_digit())
    }

    fn word(&mut self, mut buf: String) -> String {
        while let Some(&c) = self.chars.peek() {
            if !is_word_char(c) {
                break;
            }
            buf.push(c);
            self.bump();
        }
        buf
    }

    fn quoted(&mut self, line: usize, column: usize) -> Result<String, CompileError> {
        let mut buf = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error(line, column, "unterminated string")),
                Some('"') => return Ok(buf),
                Some('\\') => match self.bump() {
                    Some('n') => buf.push('\n'),
                    Some('t') => buf.push('\t'),
                    Some(c) => buf.push(c),
                    None => return Err(self.error(line, column, "unterminated string")),
                },
                Some(c) => buf.push(c),
            }
        }
    }

    fn number(&mut self, first: char, line: usize, column: usize) -> Result<TokenKind, CompileError> {
        let mut buf = String::new();
        buf.push(first);
        while let Some(&c) = self.chars.peek() {
            if !(c.is_ascii_digit() || c == '.') {
                break;
            }
            buf.push(c);
            self.bump();
        }
        if buf.contains('.') {
            buf.parse()
                .map(TokenKind::Float)
                .map_err(|_| self.error(line, column, format!("invalid number '{buf}'")))
        } else {
            buf.parse()
                .map(TokenKind::Integer)
                .map_err(|_| self.error(line, column, format!("invalid number '{buf}'")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_literals() {
        assert_eq!(
            kinds("print *\"hi\" *word \"q\\\"x\" 12 -3 1.5 &v <false>"),
            vec![
                TokenKind::Word("print".into()),
                TokenKind::Text("hi".into()),
                TokenKind::Text("word".into()),
                TokenKind::Text("q\"x".into()),
                TokenKind::Integer(12),
                TokenKind::Integer(-3),
                TokenKind::Float(1.5),
                TokenKind::Variable("v".into()),
                TokenKind::Word("false".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_positions() {
        let tokens = tokenize("def a = {\n  print 1\n}").unwrap();
        let print = tokens
            .iter()
            .find(|t| t.kind == TokenKind::Word("print".into()))
            .unwrap();
        assert_eq!((print.line, print.column), (2, 3));
    }

    #[test]
    fn test_unterminated_string() {
        let err = tokenize("print \"oops").unwrap_err();
        assert_eq!(
            err,
            CompileError::Syntax {
                line: 1,
                column: 7,
                message: "unterminated string".into()
            }
        );
    }

    #[test]
    fn test_unexpected_character() {
        assert!(matches!(
            tokenize("print ;"),
            Err(CompileError::Syntax { column: 7, .. })
        ));
    }
}
