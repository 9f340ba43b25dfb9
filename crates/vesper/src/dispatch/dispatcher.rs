// Dispatcher - Named dispatch point running its bound handlers in order
//
// A dispatcher holds weak references to its handlers; handlers own the strong
// side of the binding. Its compiled unit is the concatenation of every bound
// handler's routine, ordered by priority (highest first) then bind order.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use vesper_script::{CompileError, ScriptContext, ScriptEngine, ScriptError};

use super::handler::Handler;
use crate::compiler::{self, AssembledSource, CompiledScript, Entry, ScriptCompiler};

/// Error type for dispatcher invocations
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Dispatcher not found: {0}")]
    NotFound(String),

    #[error("Handler '{handler}' failed in dispatcher '{dispatcher}': {source}")]
    Handler {
        dispatcher: String,
        handler: String,
        #[source]
        source: ScriptError,
    },
}

struct Member {
    handler: Weak<Handler>,
    seq: u64,
}

#[derive(Default)]
struct Members {
    handlers: Vec<Member>,
    next_seq: u64,
}

/// A named dispatch point
pub struct Dispatcher {
    id: String,
    engine: Arc<dyn ScriptEngine>,
    members: Mutex<Members>,
    compiled: ArcSwapOption<CompiledScript>,
    /// Held for a whole compile so snapshots are published in order
    compile_lock: Mutex<()>,
    revision: AtomicU64,
}

impl Dispatcher {
    pub fn new(id: impl Into<String>, engine: Arc<dyn ScriptEngine>) -> Self {
        Self {
            id: id.into(),
            engine,
            members: Mutex::new(Members::default()),
            compiled: ArcSwapOption::empty(),
            compile_lock: Mutex::new(()),
            revision: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Add a handler; returns false if it was already a member
    pub fn add_handler(&self, handler: &Arc<Handler>) -> bool {
        let mut members = self.members.lock();
        members.handlers.retain(|m| m.handler.strong_count() > 0);
        if members
            .handlers
            .iter()
            .any(|m| std::ptr::eq(m.handler.as_ptr(), Arc::as_ptr(handler)))
        {
            return false;
        }
        let seq = members.next_seq;
        members.next_seq += 1;
        members.handlers.push(Member {
            handler: Arc::downgrade(handler),
            seq,
        });
        debug!(dispatcher = %self.id, handler = handler.id(), "Added handler");
        true
    }

    /// Remove a handler; returns false if it was not a member
    pub fn remove_handler(&self, handler: &Handler) -> bool {
        let mut members = self.members.lock();
        let before = members.handlers.len();
        members
            .handlers
            .retain(|m| m.handler.strong_count() > 0 && !std::ptr::eq(m.handler.as_ptr(), handler));
        let removed = members.handlers.len() < before;
        if removed {
            debug!(dispatcher = %self.id, handler = handler.id(), "Removed handler");
        }
        removed
    }

    /// Live handlers in dispatch order
    pub fn handlers(&self) -> Vec<Arc<Handler>> {
        let members: Vec<(Arc<Handler>, u64)> = self
            .members
            .lock()
            .handlers
            .iter()
            .filter_map(|m| m.handler.upgrade().map(|h| (h, m.seq)))
            .collect();

        // priorities are read outside the members lock
        let mut ordered: Vec<(i64, u64, Arc<Handler>)> = members
            .into_iter()
            .map(|(h, seq)| (h.priority(), seq, h))
            .collect();
        ordered.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        ordered.into_iter().map(|(_, _, h)| h).collect()
    }

    /// Number of successful compiles so far
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    /// Run every bound handler against `ctx`, in order.
    ///
    /// Uses the unit that was live when the call started. The first failing
    /// handler ends the invocation: handlers before it keep their effects and
    /// the ones after it do not run.
    pub async fn invoke(&self, ctx: &mut ScriptContext) -> Result<usize, DispatchError> {
        let Some(script) = self.compiled() else {
            debug!(dispatcher = %self.id, "No compiled unit, nothing to run");
            return Ok(0);
        };

        for (ran, entry) in script.entries.iter().enumerate() {
            if let Err(e) = script.unit.invoke(&entry.block, ctx).await {
                warn!(
                    dispatcher = %self.id,
                    handler = %entry.owner,
                    skipped = script.entries.len() - ran - 1,
                    error = %e,
                    "Handler failed"
                );
                return Err(DispatchError::Handler {
                    dispatcher: self.id.clone(),
                    handler: entry.owner.clone(),
                    source: e,
                });
            }
        }
        Ok(script.entries.len())
    }
}

impl ScriptCompiler for Dispatcher {
    const KIND: &'static str = "dispatcher";

    fn id(&self) -> &str {
        &self.id
    }

    fn engine(&self) -> &dyn ScriptEngine {
        self.engine.as_ref()
    }

    fn compiled_slot(&self) -> &ArcSwapOption<CompiledScript> {
        &self.compiled
    }

    fn build_source(&self) -> AssembledSource {
        let mut source = AssembledSource::default();
        let mut seen = HashSet::new();

        for handler in self.handlers() {
            let Some(script) = handler.compiled() else {
                warn!(
                    dispatcher = %self.id,
                    handler = handler.id(),
                    "Handler has no compiled script, skipping"
                );
                continue;
            };
            source.text.push_str(&script.source);
            if !script.source.ends_with('\n') {
                source.text.push('\n');
            }
            for namespace in script.unit.namespaces() {
                if seen.insert(namespace.clone()) {
                    source.namespaces.push(namespace.clone());
                }
            }
            source
                .entries
                .push(Entry::new(handler.id(), handler.entry()));
        }

        source
    }

    fn compile_script(&self) -> Result<Arc<CompiledScript>, CompileError> {
        let _guard = self.compile_lock.lock();
        let script = compiler::compile(self)?;
        self.revision.fetch_add(1, Ordering::AcqRel);
        Ok(script)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Registry of dispatchers, keyed by id
pub struct DispatcherRegistry {
    engine: Arc<dyn ScriptEngine>,
    dispatchers: DashMap<String, Arc<Dispatcher>>,
}

impl DispatcherRegistry {
    pub fn new(engine: Arc<dyn ScriptEngine>) -> Self {
        Self {
            engine,
            dispatchers: DashMap::new(),
        }
    }

    /// Register a dispatcher, returning the existing one if the id is taken
    pub fn register(&self, id: &str) -> Arc<Dispatcher> {
        self.dispatchers
            .entry(id.to_string())
            .or_insert_with(|| {
                info!(dispatcher = id, "Registered dispatcher");
                Arc::new(Dispatcher::new(id, Arc::clone(&self.engine)))
            })
            .clone()
    }

    /// Keep only the listed ids, registering any that are missing
    pub fn sync_ids(&self, ids: &[String]) {
        self.dispatchers.retain(|id, _| {
            let keep = ids.contains(id);
            if !keep {
                info!(dispatcher = %id, "Unregistered dispatcher");
            }
            keep
        });
        for id in ids {
            self.register(id);
        }
    }

    /// Get a dispatcher by id
    pub fn get(&self, id: &str) -> Option<Arc<Dispatcher>> {
        self.dispatchers.get(id).map(|d| Arc::clone(d.value()))
    }

    /// All dispatchers, sorted by id
    pub fn list(&self) -> Vec<Arc<Dispatcher>> {
        let mut list: Vec<Arc<Dispatcher>> = self.dispatchers.iter().map(|d| Arc::clone(d.value())).collect();
        list.sort_by(|a, b| a.id().cmp(b.id()));
        list
    }

    pub fn len(&self) -> usize {
        self.dispatchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dispatchers.is_empty()
    }

    /// Recompile every dispatcher
    pub fn compile_all(&self) {
        for dispatcher in self.list() {
            let _ = dispatcher.compile_script();
        }
    }
}
