// Handler - Script assembled from configuration fragments and bound to
// one or more dispatchers
//
// Lock order: `bound` may be held while a dispatcher compiles; `state` is
// only ever held briefly and never across another lock.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info, warn};
use vesper_script::assembler::{self, ExceptionClause};
use vesper_script::{ScriptContext, ScriptEngine, ScriptResult};

use super::dispatcher::{Dispatcher, DispatcherRegistry};
use crate::compiler::{AssembledSource, CompiledScript, Entry, ScriptCompiler};
use crate::project::{ConfigError, ConfigNode, Managed, ScriptText, StringList};

/// Priority used when `priority` is not set
pub const DEFAULT_PRIORITY: i64 = 8;

const KIND: &str = "handler";

/// Typed view of a handler's configuration node
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HandlerConfig {
    /// Dispatcher ids to bind to
    #[serde(default)]
    pub bind: StringList,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub namespace: StringList,
    #[serde(default)]
    pub condition: ScriptText,
    #[serde(default)]
    pub deny: ScriptText,
    #[serde(default)]
    pub handle: ScriptText,
    #[serde(default)]
    pub exception: ExceptionConfig,
}

fn default_priority() -> i64 {
    DEFAULT_PRIORITY
}

/// `exception`: a single catch-all handler or a list of `{ catch, handle }`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(from = "ExceptionShape")]
pub struct ExceptionConfig(pub Vec<ExceptionClause>);

#[derive(Deserialize)]
#[serde(untagged)]
enum ExceptionShape {
    CatchAll(String),
    Clauses(Vec<ClauseShape>),
}

#[derive(Deserialize)]
struct ClauseShape {
    #[serde(default)]
    catch: String,
    #[serde(default)]
    handle: ScriptText,
}

impl From<ExceptionShape> for ExceptionConfig {
    fn from(shape: ExceptionShape) -> Self {
        match shape {
            ExceptionShape::CatchAll(handle) => ExceptionConfig(vec![ExceptionClause::new("*", handle)]),
            ExceptionShape::Clauses(clauses) => ExceptionConfig(
                clauses
                    .into_iter()
                    .map(|c| ExceptionClause::new(c.catch, c.handle.0))
                    .collect(),
            ),
        }
    }
}

/// What a configuration diff requires
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub recompile: bool,
    pub rebind: bool,
    pub reorder: bool,
}

impl ChangeSet {
    /// Classify changed top-level keys
    pub fn from_keys<S: AsRef<str>>(keys: &[S]) -> Self {
        let mut changes = ChangeSet::default();
        for key in keys {
            match key.as_ref() {
                "bind" => {
                    changes.rebind = true;
                    changes.reorder = true;
                }
                "priority" => changes.reorder = true,
                "namespace" | "condition" | "deny" | "handle" | "exception" => changes.recompile = true,
                _ => {}
            }
        }
        changes
    }
}

struct HandlerState {
    node: ConfigNode,
    config: HandlerConfig,
}

/// Shared dependencies of all handlers
pub struct HandlerEnv {
    pub engine: Arc<dyn ScriptEngine>,
    pub dispatchers: Arc<DispatcherRegistry>,
}

/// A configured script bound to dispatchers
pub struct Handler {
    id: String,
    path: PathBuf,
    entry: String,
    engine: Arc<dyn ScriptEngine>,
    this: Weak<Handler>,
    state: Mutex<HandlerState>,
    bound: Mutex<Vec<Arc<Dispatcher>>>,
    compiled: ArcSwapOption<CompiledScript>,
}

impl Handler {
    /// Build a handler, compile it and bind it to the dispatchers it names.
    ///
    /// The bound dispatchers are not recompiled here.
    pub fn new(
        id: &str,
        path: &Path,
        node: ConfigNode,
        engine: Arc<dyn ScriptEngine>,
        registry: &DispatcherRegistry,
    ) -> Result<Arc<Self>, ConfigError> {
        let config: HandlerConfig = node.parse(KIND, id)?;
        let digest = vesper_script::digest(id);

        let handler = Arc::new_cyclic(|this| Handler {
            id: id.to_string(),
            path: path.to_path_buf(),
            entry: format!("handler_{}", &digest[..16]),
            engine,
            this: this.clone(),
            state: Mutex::new(HandlerState { node, config }),
            bound: Mutex::new(Vec::new()),
            compiled: ArcSwapOption::empty(),
        });

        let _ = handler.compile_script();
        handler.rebind(false, registry);
        debug!(handler = id, entry = %handler.entry, "Loaded handler");
        Ok(handler)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Name of the routine this handler contributes
    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn priority(&self) -> i64 {
        self.state.lock().config.priority
    }

    /// Configured dispatcher ids
    pub fn binding(&self) -> Vec<String> {
        self.state.lock().config.bind.0.clone()
    }

    /// Current typed configuration
    pub fn config(&self) -> HandlerConfig {
        self.state.lock().config.clone()
    }

    /// Dispatchers this handler is currently bound to
    pub fn dispatchers(&self) -> Vec<Arc<Dispatcher>> {
        self.bound.lock().clone()
    }

    /// Bind to a dispatcher; returns false if already bound
    fn bind_locked(&self, bound: &mut Vec<Arc<Dispatcher>>, dispatcher: &Arc<Dispatcher>) -> bool {
        if bound.iter().any(|d| Arc::ptr_eq(d, dispatcher)) {
            return false;
        }
        let Some(this) = self.this.upgrade() else {
            return false;
        };
        bound.push(Arc::clone(dispatcher));
        dispatcher.add_handler(&this);
        true
    }

    /// Reconcile bound dispatchers with the configured binding list.
    ///
    /// Dropped dispatchers are unbound and recompiled. Newly named ones are
    /// bound, and with `reorder` they and the kept ones are recompiled too.
    pub fn rebind(&self, reorder: bool, registry: &DispatcherRegistry) {
        let binding = self.binding();
        let mut bound = self.bound.lock();

        let mut kept = Vec::with_capacity(bound.len());
        for dispatcher in bound.drain(..) {
            if binding.iter().any(|id| id == dispatcher.id()) {
                if reorder {
                    let _ = dispatcher.compile_script();
                }
                kept.push(dispatcher);
            } else {
                dispatcher.remove_handler(self);
                let _ = dispatcher.compile_script();
                info!(handler = %self.id, dispatcher = dispatcher.id(), "Unbound handler");
            }
        }
        *bound = kept;

        for id in &binding {
            if bound.iter().any(|d| d.id() == id) {
                continue;
            }
            let Some(dispatcher) = registry.get(id) else {
                warn!(handler = %self.id, dispatcher = %id, "Dispatcher not found");
                continue;
            };
            if self.bind_locked(&mut bound, &dispatcher) && reorder {
                let _ = dispatcher.compile_script();
            }
        }
    }

    /// Unbind from every dispatcher and recompile them
    pub fn unbind_all(&self) {
        let dispatchers: Vec<Arc<Dispatcher>> = self.bound.lock().drain(..).collect();
        for dispatcher in dispatchers {
            dispatcher.remove_handler(self);
            let _ = dispatcher.compile_script();
        }
    }

    /// Apply an updated configuration node.
    ///
    /// A node that no longer parses is rejected and the previous
    /// configuration stays in effect.
    pub fn contrast(&self, table: toml::Table, registry: &DispatcherRegistry) -> ChangeSet {
        let config: HandlerConfig = match ConfigNode::new(table.clone()).parse(KIND, &self.id) {
            Ok(config) => config,
            Err(e) => {
                warn!(handler = %self.id, error = %e, "Rejected configuration update");
                return ChangeSet::default();
            }
        };

        let changed = {
            let mut state = self.state.lock();
            let changed = state.node.update_source(table);
            state.config = config;
            changed
        };
        let changes = ChangeSet::from_keys(&changed);
        debug!(handler = %self.id, ?changed, ?changes, "Contrasting handler");

        let recompiled = changes.recompile && self.compile_script().is_ok();
        if changes.rebind {
            self.rebind(changes.reorder, registry);
        } else if changes.reorder || recompiled {
            for dispatcher in self.dispatchers() {
                let _ = dispatcher.compile_script();
            }
        }
        changes
    }

    /// Run this handler's routine on its own
    pub async fn invoke(&self, ctx: &mut ScriptContext) -> ScriptResult<serde_json::Value> {
        match self.compiled() {
            Some(script) => script.unit.invoke(&self.entry, ctx).await,
            None => Err(vesper_script::ScriptError::BlockNotFound(self.entry.clone())),
        }
    }
}

impl ScriptCompiler for Handler {
    const KIND: &'static str = KIND;

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
        let state = self.state.lock();
        let config = &state.config;
        AssembledSource {
            text: assembler::assemble(
                &self.entry,
                config.handle.as_str(),
                config.condition.as_str(),
                config.deny.as_str(),
                &config.exception.0,
            ),
            namespaces: config.namespace.0.clone(),
            entries: vec![Entry::new(&self.id, &self.entry)],
        }
    }
}

impl Managed for Handler {
    type Env = HandlerEnv;
    const KIND: &'static str = KIND;

    fn create(id: &str, path: &Path, node: ConfigNode, env: &HandlerEnv) -> Result<Arc<Self>, ConfigError> {
        Handler::new(id, path, node, Arc::clone(&env.engine), &env.dispatchers)
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn contrast(self: &Arc<Self>, table: toml::Table, env: &HandlerEnv) {
        Handler::contrast(self, table, &env.dispatchers);
    }

    fn retire(&self, _env: &HandlerEnv) {
        self.unbind_all();
    }

    fn activate(self: &Arc<Self>, _env: &HandlerEnv) {
        for dispatcher in self.dispatchers() {
            let _ = dispatcher.compile_script();
        }
    }

    fn loaded(env: &HandlerEnv, _entities: &[Arc<Self>]) {
        env.dispatchers.compile_all();
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("id", &self.id)
            .field("entry", &self.entry)
            .finish()
    }
}
