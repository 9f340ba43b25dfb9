//! Runtime
//!
//! Wires the script engine, dispatchers, handlers and schedules of one
//! project directory together.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use vesper_script::{Console, ReferenceEngine, ScriptContext, ScriptEngine, StdConsole};

use crate::dispatch::{DispatchError, DispatcherRegistry, Handler, HandlerEnv};
use crate::project::{ConfigSync, FileChange, HANDLERS_DIR, LoadError, SCHEDULES_DIR, Settings};
use crate::schedule::{Clock, ScheduleEnv, ScheduleTask, SystemClock, TimerExecutor, TokioTimer};

/// Variable holding the trigger payload inside scripts
pub const EVENT_VARIABLE: &str = "event";

enum EngineChoice {
    /// Reference engine; settings namespaces are registered on open
    Reference(ReferenceEngine),
    /// Any other engine, used as given
    Custom(Arc<dyn ScriptEngine>),
}

/// Builder for [`Runtime`]
pub struct RuntimeBuilder {
    root: PathBuf,
    engine: EngineChoice,
    console: Arc<dyn Console>,
    clock: Arc<dyn Clock>,
    timer: Arc<dyn TimerExecutor>,
}

impl RuntimeBuilder {
    /// Use a reference engine, typically one with host actions registered
    pub fn engine(mut self, engine: ReferenceEngine) -> Self {
        self.engine = EngineChoice::Reference(engine);
        self
    }

    /// Use a custom script engine
    pub fn script_engine(mut self, engine: Arc<dyn ScriptEngine>) -> Self {
        self.engine = EngineChoice::Custom(engine);
        self
    }

    pub fn console(mut self, console: Arc<dyn Console>) -> Self {
        self.console = console;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn timer(mut self, timer: Arc<dyn TimerExecutor>) -> Self {
        self.timer = timer;
        self
    }

    /// Load settings, handlers and schedules. Schedules are not started.
    pub async fn open(self) -> Result<Runtime, LoadError> {
        let root = self.root;
        info!("Opening project at {}", root.display());

        let settings = Settings::load(&root).await?;

        let engine: Arc<dyn ScriptEngine> = match self.engine {
            EngineChoice::Reference(mut engine) => {
                for namespace in &settings.engine.namespaces {
                    engine.register_namespace(namespace.clone());
                }
                Arc::new(engine)
            }
            EngineChoice::Custom(engine) => engine,
        };

        let dispatchers = Arc::new(DispatcherRegistry::new(Arc::clone(&engine)));
        dispatchers.sync_ids(&settings.dispatchers);

        let handlers = ConfigSync::new(
            root.join(HANDLERS_DIR),
            Arc::new(HandlerEnv {
                engine: Arc::clone(&engine),
                dispatchers: Arc::clone(&dispatchers),
            }),
        );
        let schedules = ConfigSync::new(
            root.join(SCHEDULES_DIR),
            Arc::new(ScheduleEnv {
                engine,
                timer: self.timer,
                clock: self.clock,
                console: Arc::clone(&self.console),
                date_format: RwLock::new(settings.schedule_setting.date_format.clone()),
                active: AtomicBool::new(false),
            }),
        );

        let runtime = Runtime {
            root,
            settings: ArcSwap::from_pointee(settings),
            console: self.console,
            dispatchers,
            handlers,
            schedules,
        };
        runtime.handlers.load().await?;
        runtime.schedules.load().await?;
        Ok(runtime)
    }
}

/// A loaded project
pub struct Runtime {
    root: PathBuf,
    settings: ArcSwap<Settings>,
    console: Arc<dyn Console>,
    dispatchers: Arc<DispatcherRegistry>,
    handlers: ConfigSync<Handler>,
    schedules: ConfigSync<ScheduleTask>,
}

impl Runtime {
    /// Start building a runtime for the project at `root`
    pub fn builder(root: impl Into<PathBuf>) -> RuntimeBuilder {
        RuntimeBuilder {
            root: root.into(),
            engine: EngineChoice::Reference(ReferenceEngine::new()),
            console: Arc::new(StdConsole),
            clock: Arc::new(SystemClock),
            timer: Arc::new(TokioTimer),
        }
    }

    /// Open a project with default services
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, LoadError> {
        Self::builder(root).open().await
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Current settings
    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    pub fn dispatchers(&self) -> &Arc<DispatcherRegistry> {
        &self.dispatchers
    }

    pub fn handlers(&self) -> &ConfigSync<Handler> {
        &self.handlers
    }

    pub fn schedules(&self) -> &ConfigSync<ScheduleTask> {
        &self.schedules
    }

    /// A fresh execution context printing to the runtime console
    pub fn context(&self) -> ScriptContext {
        ScriptContext::new(Arc::clone(&self.console))
    }

    /// Invoke a dispatcher against `ctx`
    pub async fn fire(&self, dispatcher: &str, ctx: &mut ScriptContext) -> Result<usize, DispatchError> {
        let target = self
            .dispatchers
            .get(dispatcher)
            .ok_or_else(|| DispatchError::NotFound(dispatcher.to_string()))?;
        debug!(dispatcher, "Firing dispatcher");
        target.invoke(ctx).await
    }

    /// Invoke a dispatcher with a trigger payload, also readable as `&event`
    pub async fn fire_event(&self, dispatcher: &str, event: Value) -> Result<usize, DispatchError> {
        let mut ctx = self
            .context()
            .with_variable(EVENT_VARIABLE, event.clone())
            .with_event(event);
        self.fire(dispatcher, &mut ctx).await
    }

    /// Start all schedules
    pub fn start(&self) {
        self.schedules.start_all();
    }

    /// Stop all schedules
    pub fn shutdown(&self) {
        self.schedules.shutdown();
    }

    /// Reload settings, then every handler and schedule.
    ///
    /// Every file is read and parsed first; if any fails nothing changes.
    pub async fn reload(&self) -> Result<(), LoadError> {
        let settings = Settings::load(&self.root).await?;
        let handlers = self.handlers.prepare().await?;
        let schedules = self.schedules.prepare().await?;
        debug!(
            handler_files = handlers.files(),
            schedule_files = schedules.files(),
            "Project files parsed"
        );

        let previous = self.settings.load_full();
        if settings.engine.namespaces != previous.engine.namespaces {
            warn!("Engine namespaces changed; restart to apply them");
        }

        self.dispatchers.sync_ids(&settings.dispatchers);
        *self.schedules.env().date_format.write() = settings.schedule_setting.date_format.clone();
        self.settings.store(Arc::new(settings));

        self.handlers.apply(handlers).await;
        self.schedules.apply(schedules).await;
        Ok(())
    }

    /// Apply one watched file change
    pub async fn apply_change(&self, change: FileChange) {
        let settings = self.settings();
        match change {
            FileChange::Handler(path) => {
                if !settings.automatic_reload.handler {
                    debug!("Handler automatic reload disabled, ignoring {}", path.display());
                    return;
                }
                // failures are logged by the sync
                let _ = self.handlers.sync_file(&path).await;
            }
            FileChange::Schedule(path) => {
                if !settings.automatic_reload.schedule {
                    debug!("Schedule automatic reload disabled, ignoring {}", path.display());
                    return;
                }
                let _ = self.schedules.sync_file(&path).await;
            }
            FileChange::Settings => {
                info!("Settings changed, reloading project");
                if let Err(e) = self.reload().await {
                    error!("Failed to reload project: {}", e);
                }
            }
        }
    }
}
