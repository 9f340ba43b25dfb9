// Interpreter - Executable node tree produced by the parser
//
// Every statement is a node; every argument is a live parameter that either
// holds a literal or defers to a nested node.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use wildmatch::WildMatch;

use crate::context::ScriptContext;
use crate::live::LiveParameter;
use crate::unit::{Executable, ScriptError, ScriptResult};

/// Variable holding the message of the error a `catch` arm is handling
pub const ERROR_VARIABLE: &str = "error";

/// Host-provided leaf action
///
/// Actions receive their arguments unresolved so they decide when (and
/// whether) each nested computation runs.
#[async_trait]
pub trait Action: Send + Sync {
    async fn execute(
        &self,
        args: &[LiveParameter<Value>],
        ctx: &mut ScriptContext,
    ) -> ScriptResult<Value>;
}

/// One `catch with <matcher>` arm
pub(crate) struct Catch {
    pattern: String,
    matcher: WildMatch,
    body: Arc<Node>,
}

impl Catch {
    pub(crate) fn new(pattern: String, body: Arc<Node>) -> Self {
        let matcher = WildMatch::new(&pattern);
        Self {
            pattern,
            matcher,
            body,
        }
    }

    /// Empty and `*` match everything; otherwise the pattern is tried as a
    /// wildcard against the error kind and message, then as a substring.
    fn matches(&self, error: &ScriptError) -> bool {
        let pattern = self.pattern.trim();
        if pattern.is_empty() || pattern == "*" {
            return true;
        }
        let message = error.to_string();
        self.matcher.matches(error.kind()) || self.matcher.matches(&message) || message.contains(pattern)
    }
}

/// Executable statement
pub(crate) enum Node {
    Literal(Value),
    Variable(String),
    Block(Vec<Arc<Node>>),
    Print(LiveParameter<String>),
    Set {
        name: String,
        value: LiveParameter<Value>,
    },
    Not(LiveParameter<bool>),
    If {
        condition: LiveParameter<bool>,
        then: Arc<Node>,
        otherwise: Option<Arc<Node>>,
    },
    Try {
        body: Arc<Node>,
        clauses: Vec<Catch>,
    },
    Throw(LiveParameter<String>),
    Call(String),
    Wait(LiveParameter<u64>),
    Host {
        name: String,
        action: Arc<dyn Action>,
        args: Vec<LiveParameter<Value>>,
    },
}

impl Node {
    /// Turn a parsed node into an argument
    pub(crate) fn into_param(node: Arc<Node>) -> LiveParameter<Value> {
        match &*node {
            Node::Literal(value) => LiveParameter::Constant(value.clone()),
            _ => LiveParameter::Deferred(node),
        }
    }
}

#[async_trait]
impl Executable for Node {
    async fn run(&self, ctx: &mut ScriptContext) -> ScriptResult<Value> {
        match self {
            Node::Literal(value) => Ok(value.clone()),

            Node::Variable(name) => Ok(ctx.get_variable(name).cloned().unwrap_or(Value::Null)),

            Node::Block(statements) => {
                let mut last = Value::Null;
                for statement in statements {
                    last = statement.run(ctx).await?;
                }
                Ok(last)
            }

            Node::Print(text) => {
                let line = text.resolve(ctx).await?;
                ctx.print(&line);
                Ok(Value::Null)
            }

            Node::Set { name, value } => {
                let value = value.resolve(ctx).await?;
                ctx.set_variable(name, value.clone());
                Ok(value)
            }

            Node::Not(value) => Ok(Value::Bool(!value.resolve(ctx).await?)),

            Node::If {
                condition,
                then,
                otherwise,
            } => {
                if condition.resolve(ctx).await? {
                    then.run(ctx).await
                } else if let Some(otherwise) = otherwise {
                    otherwise.run(ctx).await
                } else {
                    Ok(Value::Null)
                }
            }

            Node::Try { body, clauses } => match body.run(ctx).await {
                Ok(value) => Ok(value),
                Err(error) => {
                    let Some(clause) = clauses.iter().find(|c| c.matches(&error)) else {
                        return Err(error);
                    };
                    tracing::trace!(pattern = %clause.pattern, %error, "Caught script error");
                    ctx.set_variable(ERROR_VARIABLE, Value::String(error.to_string()));
                    clause.body.run(ctx).await
                }
            },

            Node::Throw(message) => {
                let message = message.resolve(ctx).await?;
                Err(match message.split_once(": ") {
                    Some((kind, rest)) if !kind.contains(char::is_whitespace) => {
                        ScriptError::thrown(kind, rest)
                    }
                    _ => ScriptError::thrown("error", message),
                })
            }

            Node::Call(name) => {
                let routine = ctx
                    .routine(name)
                    .ok_or_else(|| ScriptError::BlockNotFound(name.clone()))?;
                if !ctx.enter_call() {
                    return Err(ScriptError::DepthExceeded(ctx.depth()));
                }
                let result = routine.run(ctx).await;
                ctx.leave_call();
                result
            }

            Node::Wait(millis) => {
                let millis = millis.resolve(ctx).await?;
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(Value::Null)
            }

            Node::Host { name, action, args } => {
                action.execute(args, ctx).await.map_err(|e| match e {
                    ScriptError::Action { .. } | ScriptError::Thrown { .. } => e,
                    other => ScriptError::Action {
                        name: name.clone(),
                        message: other.to_string(),
                    },
                })
            }
        }
    }
}
