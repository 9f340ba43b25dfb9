// Live Parameters - Values resolved against an execution context
//
// An action argument is either fixed at compile time or a nested action
// whose result is only known once the invocation reaches it.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::context::{ScriptContext, display_value, is_truthy};
use crate::unit::{Executable, ScriptError, ScriptResult};

// ─────────────────────────────────────────────────────────────────────────────
// Value Conversion
// ─────────────────────────────────────────────────────────────────────────────

/// Conversion from a script value into a typed parameter
pub trait FromValue: Sized {
    fn from_value(value: Value) -> ScriptResult<Self>;
}

impl FromValue for Value {
    fn from_value(value: Value) -> ScriptResult<Self> {
        Ok(value)
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> ScriptResult<Self> {
        Ok(display_value(&value))
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> ScriptResult<Self> {
        Ok(is_truthy(&value))
    }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> ScriptResult<Self> {
        match &value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| mismatch("integer", &value)),
            Value::String(s) => s.trim().parse().map_err(|_| mismatch("integer", &value)),
            _ => Err(mismatch("integer", &value)),
        }
    }
}

impl FromValue for u64 {
    fn from_value(value: Value) -> ScriptResult<Self> {
        let n = i64::from_value(value.clone())?;
        u64::try_from(n).map_err(|_| mismatch("unsigned integer", &value))
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> ScriptResult<Self> {
        match &value {
            Value::Number(n) => n.as_f64().ok_or_else(|| mismatch("number", &value)),
            Value::String(s) => s.trim().parse().map_err(|_| mismatch("number", &value)),
            _ => Err(mismatch("number", &value)),
        }
    }
}

fn mismatch(expected: &'static str, found: &Value) -> ScriptError {
    ScriptError::TypeMismatch {
        expected,
        found: found.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Live Parameter
// ─────────────────────────────────────────────────────────────────────────────

/// A lazily resolved value bound to an execution context
///
/// Immutable once built. Each resolution runs independently; nothing is
/// cached between invocations.
pub enum LiveParameter<T> {
    /// Fixed at compile time
    Constant(T),
    /// Produced by a nested action at run time
    Deferred(Arc<dyn Executable>),
}

impl<T> LiveParameter<T>
where
    T: FromValue + Clone + Send + Sync,
{
    /// Build a parameter from a compile-time value
    pub fn constant(value: T) -> Self {
        Self::Constant(value)
    }

    /// Build a parameter backed by a nested action
    pub fn deferred(action: Arc<dyn Executable>) -> Self {
        Self::Deferred(action)
    }

    /// Whether this parameter is known without running anything
    pub fn is_constant(&self) -> bool {
        matches!(self, Self::Constant(_))
    }

    /// Resolve against `ctx`, running the nested action if there is one
    pub async fn resolve(&self, ctx: &mut ScriptContext) -> ScriptResult<T> {
        match self {
            Self::Constant(value) => Ok(value.clone()),
            Self::Deferred(action) => {
                let value = action.run(ctx).await?;
                T::from_value(value)
            }
        }
    }
}

impl LiveParameter<Value> {
    /// Narrow an untyped parameter to `T`.
    ///
    /// Constants are converted eagerly; a constant that does not convert is
    /// kept deferred so the mismatch surfaces at run time.
    pub fn typed<T>(self) -> LiveParameter<T>
    where
        T: FromValue + Clone + Send + Sync,
    {
        match self {
            Self::Constant(value) => match T::from_value(value.clone()) {
                Ok(typed) => LiveParameter::Constant(typed),
                Err(_) => LiveParameter::Deferred(Arc::new(ConstantAction(value))),
            },
            Self::Deferred(action) => LiveParameter::Deferred(action),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for LiveParameter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant(value) => f.debug_tuple("Constant").field(value).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

struct ConstantAction(Value);

#[async_trait::async_trait]
impl Executable for ConstantAction {
    async fn run(&self, _ctx: &mut ScriptContext) -> ScriptResult<Value> {
        Ok(self.0.clone())
    }
}
