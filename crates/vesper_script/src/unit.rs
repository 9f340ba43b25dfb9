// Compiled Units - The boundary between the core and a script engine
//
// A unit is the immutable result of compiling one source body. Engines hand
// back named executable blocks; the core only ever invokes them by name.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::ScriptContext;

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised while compiling a source body
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    #[error("syntax error at {line}:{column}: {message}")]
    Syntax {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("unknown namespace: {0}")]
    UnknownNamespace(String),

    #[error("unknown action '{name}' at {line}:{column}")]
    UnknownAction {
        name: String,
        line: usize,
        column: usize,
    },

    #[error("routine '{0}' is defined more than once")]
    DuplicateRoutine(String),

    #[error("call to undefined routine '{0}'")]
    UndefinedRoutine(String),
}

/// Errors raised while running a compiled block
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScriptError {
    #[error("{kind}: {message}")]
    Thrown { kind: String, message: String },

    #[error("block not found: {0}")]
    BlockNotFound(String),

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: String,
    },

    #[error("action '{name}' failed: {message}")]
    Action { name: String, message: String },

    #[error("call depth exceeded ({0})")]
    DepthExceeded(usize),
}

impl ScriptError {
    /// Create a script-level error with an explicit kind
    pub fn thrown(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Thrown {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Short classifier used by exception matchers
    pub fn kind(&self) -> &str {
        match self {
            ScriptError::Thrown { kind, .. } => kind,
            ScriptError::BlockNotFound(_) => "block-not-found",
            ScriptError::TypeMismatch { .. } => "type-mismatch",
            ScriptError::Action { .. } => "action",
            ScriptError::DepthExceeded(_) => "depth-exceeded",
        }
    }
}

/// Result type for script execution
pub type ScriptResult<T> = Result<T, ScriptError>;

// ─────────────────────────────────────────────────────────────────────────────
// Executable Blocks
// ─────────────────────────────────────────────────────────────────────────────

/// Something that can be run against an execution context
#[async_trait]
pub trait Executable: Send + Sync {
    /// Run to completion and yield the resulting value
    async fn run(&self, ctx: &mut ScriptContext) -> ScriptResult<Value>;
}

/// Named blocks of a single unit, shared with contexts during invocation
pub type BlockTable = BTreeMap<String, Arc<dyn Executable>>;

/// Immutable result of compiling an assembled source body
#[derive(Clone)]
pub struct CompiledUnit {
    digest: String,
    namespaces: Vec<String>,
    blocks: Arc<BlockTable>,
}

impl CompiledUnit {
    /// Create a unit for `source` compiled under `namespaces`
    pub fn new(source: &str, namespaces: &[String], blocks: BlockTable) -> Self {
        Self {
            digest: digest(source),
            namespaces: namespaces.to_vec(),
            blocks: Arc::new(blocks),
        }
    }

    /// Hash of the source this unit was compiled from
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn namespaces(&self) -> &[String] {
        &self.namespaces
    }

    /// Get a block by name
    pub fn block(&self, name: &str) -> Option<Arc<dyn Executable>> {
        self.blocks.get(name).cloned()
    }

    /// Check if a block exists
    pub fn contains(&self, name: &str) -> bool {
        self.blocks.contains_key(name)
    }

    /// Names of all blocks, sorted
    pub fn block_names(&self) -> impl Iterator<Item = &str> {
        self.blocks.keys().map(|s| s.as_str())
    }

    /// Run one block of this unit.
    ///
    /// The unit's block table is installed on the context for the duration of
    /// the call so that `call` statements resolve against this unit.
    pub async fn invoke(&self, block: &str, ctx: &mut ScriptContext) -> ScriptResult<Value> {
        let executable = self
            .block(block)
            .ok_or_else(|| ScriptError::BlockNotFound(block.to_string()))?;

        let previous = ctx.install_blocks(Arc::clone(&self.blocks));
        let result = executable.run(ctx).await;
        ctx.restore_blocks(previous);
        result
    }
}

impl fmt::Debug for CompiledUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledUnit")
            .field("digest", &self.digest)
            .field("namespaces", &self.namespaces)
            .field("blocks", &self.blocks.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Identity hash of a source body
pub fn digest(source: &str) -> String {
    blake3::hash(source.as_bytes()).to_hex().to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Script Engine Capability
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque compile step for assembled source text
///
/// Any DSL engine can implement this. Compilation must be side-effect free:
/// a failed compile leaves nothing behind.
pub trait ScriptEngine: Send + Sync {
    /// Compile `source` with the given namespaces enabled
    fn compile(&self, source: &str, namespaces: &[String]) -> Result<CompiledUnit, CompileError>;
}
