//! Script Compiler
//!
//! Shared compile lifecycle for every scriptable entity (handlers, dispatchers,
//! schedule tasks). An entity assembles its source, the engine compiles it, and
//! the result replaces the previous unit in a single atomic swap. A failed
//! compile is logged and the previous unit stays live.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tracing::{debug, error};
use vesper_script::{CompileError, CompiledUnit, ScriptEngine};

/// A routine that can be invoked from a compiled unit on behalf of an entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Id of the entity that contributed the routine
    pub owner: String,
    /// Routine name inside the unit
    pub block: String,
}

impl Entry {
    pub fn new(owner: impl Into<String>, block: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            block: block.into(),
        }
    }
}

/// Source text ready for compilation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssembledSource {
    pub text: String,
    pub namespaces: Vec<String>,
    /// Routines to run, in order, when the entity is invoked
    pub entries: Vec<Entry>,
}

/// Snapshot of a successful compilation
#[derive(Debug)]
pub struct CompiledScript {
    pub unit: CompiledUnit,
    pub source: String,
    pub entries: Vec<Entry>,
}

/// An entity that owns a compiled unit
pub trait ScriptCompiler: Send + Sync {
    /// Entity kind used in log output
    const KIND: &'static str;

    fn id(&self) -> &str;

    fn engine(&self) -> &dyn ScriptEngine;

    /// Slot holding the live compiled unit
    fn compiled_slot(&self) -> &ArcSwapOption<CompiledScript>;

    /// Assemble the current source. Must not touch the compiled slot.
    fn build_source(&self) -> AssembledSource;

    /// Rebuild and swap in a new unit.
    ///
    /// On failure the previous unit is kept and the error is logged.
    fn compile_script(&self) -> Result<Arc<CompiledScript>, CompileError> {
        compile(self)
    }

    /// The live compiled unit, if any compile ever succeeded
    fn compiled(&self) -> Option<Arc<CompiledScript>> {
        self.compiled_slot().load_full()
    }
}

/// Compile `entity` and publish the result
pub fn compile<C: ScriptCompiler + ?Sized>(entity: &C) -> Result<Arc<CompiledScript>, CompileError> {
    let AssembledSource {
        text,
        namespaces,
        entries,
    } = entity.build_source();

    match entity.engine().compile(&text, &namespaces) {
        Ok(unit) => {
            debug!(
                kind = C::KIND,
                id = entity.id(),
                digest = unit.digest(),
                entries = entries.len(),
                "Compiled script"
            );
            let script = Arc::new(CompiledScript {
                unit,
                source: text,
                entries,
            });
            entity.compiled_slot().store(Some(Arc::clone(&script)));
            Ok(script)
        }
        Err(e) => {
            error!(
                kind = C::KIND,
                id = entity.id(),
                error = %e,
                source = %text,
                "Failed to compile script, keeping previous version"
            );
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use vesper_script::ReferenceEngine;

    struct Fixture {
        engine: ReferenceEngine,
        body: Mutex<String>,
        slot: ArcSwapOption<CompiledScript>,
    }

    impl ScriptCompiler for Fixture {
        const KIND: &'static str = "fixture";

        fn id(&self) -> &str {
            "fixture"
        }

        fn engine(&self) -> &dyn ScriptEngine {
            &self.engine
        }

        fn compiled_slot(&self) -> &ArcSwapOption<CompiledScript> {
            &self.slot
        }

        fn build_source(&self) -> AssembledSource {
            AssembledSource {
                text: self.body.lock().clone(),
                namespaces: vec![],
                entries: vec![Entry::new("fixture", "main")],
            }
        }
    }

    fn fixture(body: &str) -> Fixture {
        Fixture {
            engine: ReferenceEngine::new(),
            body: Mutex::new(body.to_string()),
            slot: ArcSwapOption::empty(),
        }
    }

    #[test]
    fn test_success_publishes_unit() {
        let f = fixture("print 1");
        assert!(f.compiled().is_none());

        let script = f.compile_script().unwrap();
        assert_eq!(script.source, "print 1");
        assert_eq!(f.compiled().unwrap().unit.digest(), script.unit.digest());
    }

    #[test]
    fn test_failure_keeps_previous_unit() {
        let f = fixture("print 1");
        let first = f.compile_script().unwrap();

        *f.body.lock() = "print".to_string();
        assert!(f.compile_script().is_err());

        let live = f.compiled().unwrap();
        assert!(Arc::ptr_eq(&first, &live));
        assert_eq!(live.source, "print 1");
    }

    #[test]
    fn test_failure_without_previous_leaves_empty() {
        let f = fixture("}");
        assert!(f.compile_script().is_err());
        assert!(f.compiled().is_none());
    }
}
