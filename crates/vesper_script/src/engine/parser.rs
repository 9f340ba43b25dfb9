// Parser - Builds the executable node tree from tokens
//
// Grammar (informal):
//   program   := routine* | statement*
//   routine   := "def" WORD "=" block
//   body      := block | statement
//   statement := literal | &var | block | keyword-statement | action arg*

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde_json::{Number, Value};

use super::interpreter::{Action, Catch, Node};
use super::lexer::{Token, TokenKind};
use crate::live::LiveParameter;
use crate::unit::CompileError;

/// Routine name given to a program without explicit `def`s
pub const MAIN_ROUTINE: &str = "main";

/// A host action visible to the parser
#[derive(Clone)]
pub(crate) struct ActionDef {
    pub arity: usize,
    pub action: Arc<dyn Action>,
}

/// Actions available to one compilation, already merged across namespaces
pub(crate) type ActionTable = HashMap<String, ActionDef>;

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    actions: &'a ActionTable,
    calls: HashSet<String>,
}

/// Parse a token stream into named routines
pub(crate) fn parse(
    tokens: Vec<Token>,
    actions: &ActionTable,
) -> Result<BTreeMap<String, Arc<Node>>, CompileError> {
    let mut parser = Parser {
        tokens,
        pos: 0,
        actions,
        calls: HashSet::new(),
    };

    let routines = if parser.at_word("def") {
        parser.routines()?
    } else {
        let mut statements = Vec::new();
        while !parser.at(&TokenKind::Eof) {
            statements.push(parser.statement()?);
        }
        BTreeMap::from([(MAIN_ROUTINE.to_string(), Arc::new(Node::Block(statements)))])
    };

    for call in &parser.calls {
        if !routines.contains_key(call) {
            return Err(CompileError::UndefinedRoutine(call.clone()));
        }
    }

    Ok(routines)
}

impl Parser<'_> {
    fn peek(&self) -> &Token {
        // tokenize always ends with Eof, and we never advance past it
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn at(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn at_word(&self, word: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Word(w) if w == word)
    }

    fn error_at(token: &Token, message: impl Into<String>) -> CompileError {
        CompileError::Syntax {
            line: token.line,
            column: token.column,
            message: message.into(),
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token, CompileError> {
        let token = self.advance();
        if token.kind == kind {
            Ok(token)
        } else {
            Err(Self::error_at(&token, format!("expected {what}, found {:?}", token.kind)))
        }
    }

    fn expect_word(&mut self, word: &str) -> Result<(), CompileError> {
        let token = self.advance();
        match &token.kind {
            TokenKind::Word(w) if w == word => Ok(()),
            other => Err(Self::error_at(&token, format!("expected '{word}', found {other:?}"))),
        }
    }

    fn name(&mut self, what: &str) -> Result<String, CompileError> {
        let token = self.advance();
        match token.kind.clone() {
            TokenKind::Word(w) => Ok(w),
            other => Err(Self::error_at(&token, format!("expected {what}, found {other:?}"))),
        }
    }

    fn routines(&mut self) -> Result<BTreeMap<String, Arc<Node>>, CompileError> {
        let mut routines = BTreeMap::new();
        while !self.at(&TokenKind::Eof) {
            self.expect_word("def")?;
            let name = self.name("routine name")?;
            self.expect(TokenKind::Equals, "'='")?;
            let body = self.block()?;
            if routines.insert(name.clone(), body).is_some() {
                return Err(CompileError::DuplicateRoutine(name));
            }
        }
        Ok(routines)
    }

    fn block(&mut self) -> Result<Arc<Node>, CompileError> {
        self.expect(TokenKind::LBrace, "'{'")?;
        let mut statements = Vec::new();
        while !self.at(&TokenKind::RBrace) {
            if self.at(&TokenKind::Eof) {
                return Err(Self::error_at(self.peek(), "unclosed '{'"));
            }
            statements.push(self.statement()?);
        }
        self.advance();
        Ok(Arc::new(Node::Block(statements)))
    }

    fn body(&mut self) -> Result<Arc<Node>, CompileError> {
        if self.at(&TokenKind::LBrace) {
            self.block()
        } else {
            self.statement()
        }
    }

    fn param(&mut self) -> Result<LiveParameter<Value>, CompileError> {
        Ok(Node::into_param(self.statement()?))
    }

    fn statement(&mut self) -> Result<Arc<Node>, CompileError> {
        if self.at(&TokenKind::LBrace) {
            return self.block();
        }

        let token = self.advance();
        let node = match token.kind.clone() {
            TokenKind::Text(text) => Node::Literal(Value::String(text)),
            TokenKind::Integer(n) => Node::Literal(Value::from(n)),
            TokenKind::Float(f) => Node::Literal(Number::from_f64(f).map_or(Value::Null, Value::Number)),
            TokenKind::Variable(name) => Node::Variable(name),
            TokenKind::Word(word) => return self.keyword(&token, &word),
            other => return Err(Self::error_at(&token, format!("unexpected {other:?}"))),
        };
        Ok(Arc::new(node))
    }

    fn keyword(&mut self, token: &Token, word: &str) -> Result<Arc<Node>, CompileError> {
        let node = match word {
            "null" => Node::Literal(Value::Null),
            "true" => Node::Literal(Value::Bool(true)),
            "false" => Node::Literal(Value::Bool(false)),
            "print" => Node::Print(self.param()?.typed()),
            "set" => {
                let name = self.name("variable name")?;
                self.expect_word("to")?;
                Node::Set {
                    name,
                    value: self.param()?,
                }
            }
            "get" => Node::Variable(self.name("variable name")?),
            "not" => Node::Not(self.param()?.typed()),
            "if" => {
                let condition = self.param()?.typed();
                self.expect_word("then")?;
                let then = self.body()?;
                let otherwise = if self.at_word("else") {
                    self.advance();
                    Some(self.body()?)
                } else {
                    None
                };
                Node::If {
                    condition,
                    then,
                    otherwise,
                }
            }
            "try" => {
                let body = self.body()?;
                let mut clauses = Vec::new();
                while self.at_word("catch") {
                    self.advance();
                    self.expect_word("with")?;
                    let pattern_token = self.advance();
                    let pattern = match pattern_token.kind.clone() {
                        TokenKind::Text(t) | TokenKind::Word(t) => t,
                        other => {
                            return Err(Self::error_at(
                                &pattern_token,
                                format!("expected error matcher, found {other:?}"),
                            ));
                        }
                    };
                    clauses.push(Catch::new(pattern, self.body()?));
                }
                if clauses.is_empty() {
                    return Err(Self::error_at(token, "'try' without 'catch'"));
                }
                Node::Try { body, clauses }
            }
            "throw" => Node::Throw(self.param()?.typed()),
            "call" => {
                let name = self.name("routine name")?;
                self.calls.insert(name.clone());
                Node::Call(name)
            }
            "wait" => Node::Wait(self.param()?.typed()),
            "def" => return Err(Self::error_at(token, "'def' is only allowed at top level")),
            "then" | "else" | "catch" | "with" | "to" => {
                return Err(Self::error_at(token, format!("unexpected '{word}'")));
            }
            other => {
                let Some(def) = self.actions.get(other).cloned() else {
                    return Err(CompileError::UnknownAction {
                        name: other.to_string(),
                        line: token.line,
                        column: token.column,
                    });
                };
                let mut args = Vec::with_capacity(def.arity);
                for _ in 0..def.arity {
                    args.push(self.param()?);
                }
                Node::Host {
                    name: other.to_string(),
                    action: def.action,
                    args,
                }
            }
        };
        Ok(Arc::new(node))
    }
}
