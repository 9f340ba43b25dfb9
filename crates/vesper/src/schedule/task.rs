// ScheduleTask - A scripted execution fired at planned times
//
// Timing values are resolved once per configuration change. The timer job
// re-checks the end instant on every firing and stops itself once reached.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tracing::{debug, error, info, warn};
use vesper_script::engine::{CORE_NAMESPACE, MAIN_ROUTINE};
use vesper_script::{Console, ScriptContext, ScriptEngine, assembler};

use super::timer::{Job, TimerExecutor, TimerHandle, TimerSpec};
use super::timing::{self, Clock, FirePlan, ScheduleError, Timing, UNSET};
use crate::compiler::{AssembledSource, CompiledScript, Entry, ScriptCompiler};
use crate::project::{ConfigError, ConfigNode, Managed, ScriptText, StringList};

const KIND: &str = "schedule";

/// Typed view of a schedule's configuration node
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScheduleConfig {
    /// Overrides the global date format for `start` and `end`
    #[serde(default)]
    pub date_format: Option<String>,
    #[serde(default, rename = "async")]
    pub is_async: bool,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default = "default_namespace")]
    pub namespace: StringList,
    #[serde(default)]
    pub execute: Option<ScriptText>,
}

fn default_namespace() -> StringList {
    StringList(vec![CORE_NAMESPACE.to_string()])
}

/// What a configuration diff requires
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleChanges {
    pub recompile: bool,
    pub restart: bool,
}

impl ScheduleChanges {
    /// Classify changed top-level keys
    pub fn from_keys<S: AsRef<str>>(keys: &[S]) -> Self {
        let mut changes = ScheduleChanges::default();
        for key in keys {
            match key.as_ref() {
                "namespace" | "execute" => changes.recompile = true,
                "async" | "start" | "end" | "period" | "date-format" => changes.restart = true,
                _ => {}
            }
        }
        changes
    }
}

/// Shared dependencies of all schedule tasks
pub struct ScheduleEnv {
    pub engine: Arc<dyn ScriptEngine>,
    pub timer: Arc<dyn TimerExecutor>,
    pub clock: Arc<dyn Clock>,
    pub console: Arc<dyn Console>,
    /// Global date format, used when a task sets none
    pub date_format: RwLock<String>,
    /// Whether new tasks start as soon as they are created
    pub active: AtomicBool,
}

impl ScheduleEnv {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

struct TaskState {
    node: ConfigNode,
    config: ScheduleConfig,
    timing: Timing,
    /// Set when the configuration cannot be scheduled at all
    invalid: Option<ScheduleError>,
    date_format: String,
}

/// A scheduled script execution
pub struct ScheduleTask {
    id: String,
    path: PathBuf,
    engine: Arc<dyn ScriptEngine>,
    timer: Arc<dyn TimerExecutor>,
    clock: Arc<dyn Clock>,
    console: Arc<dyn Console>,
    default_date_format: String,
    this: Weak<ScheduleTask>,
    state: Mutex<TaskState>,
    running: Mutex<Option<TimerHandle>>,
    compiled: ArcSwapOption<CompiledScript>,
}

impl ScheduleTask {
    /// Build a task and compile its script; the task is not started
    pub fn new(id: &str, path: &Path, node: ConfigNode, env: &ScheduleEnv) -> Result<Arc<Self>, ConfigError> {
        let config: ScheduleConfig = node.parse(KIND, id)?;
        let default_date_format = env.date_format.read().clone();
        let Resolved {
            timing,
            invalid,
            date_format,
        } = resolve(id, &config, &default_date_format);

        let task = Arc::new_cyclic(|this| ScheduleTask {
            id: id.to_string(),
            path: path.to_path_buf(),
            engine: Arc::clone(&env.engine),
            timer: Arc::clone(&env.timer),
            clock: Arc::clone(&env.clock),
            console: Arc::clone(&env.console),
            default_date_format,
            this: this.clone(),
            state: Mutex::new(TaskState {
                node,
                config,
                timing,
                invalid,
                date_format,
            }),
            running: Mutex::new(None),
            compiled: ArcSwapOption::empty(),
        });

        let _ = task.compile_script();
        Ok(task)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolved timing
    pub fn timing(&self) -> Timing {
        self.state.lock().timing
    }

    /// Current typed configuration
    pub fn config(&self) -> ScheduleConfig {
        self.state.lock().config.clone()
    }

    /// Whether a timer is currently scheduled
    pub fn is_running(&self) -> bool {
        self.running.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// (Re)start the task from the current time.
    ///
    /// Any previous timer is cancelled first. Nothing is scheduled when the
    /// end instant has passed or the timing is invalid.
    pub fn run(&self) {
        self.terminate();

        let (timing, invalid, date_format) = {
            let state = self.state.lock();
            (state.timing, state.invalid.clone(), state.date_format.clone())
        };
        let now = self.clock.now_millis();

        let plan = match invalid.map_or_else(|| timing::plan(now, &timing), Err) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(schedule = %self.id, error = %e, "Invalid schedule timing, not started");
                return;
            }
        };

        let (delay, period) = match plan {
            FirePlan::Expired => {
                info!(
                    schedule = %self.id,
                    end = %timing::format_instant(timing.end, &date_format),
                    "Schedule has completed"
                );
                return;
            }
            FirePlan::Once { delay } => (delay, None),
            FirePlan::Periodic { delay, period } => (delay, Some(period)),
        };

        debug!(
            schedule = %self.id,
            is_async = timing.is_async,
            delay_ms = delay,
            period_ms = period.unwrap_or(0),
            start = %timing::format_instant(timing.start, &date_format),
            "Schedule ready to run"
        );

        let spec = TimerSpec {
            is_async: timing.is_async,
            delay: Duration::from_millis(delay),
            period: period.map(Duration::from_millis),
        };
        let handle = self.timer.submit(spec, self.job());
        *self.running.lock() = Some(handle);
    }

    /// Cancel the timer, if any
    pub fn terminate(&self) {
        if let Some(handle) = self.running.lock().take() {
            handle.cancel();
            debug!(schedule = %self.id, "Schedule terminated");
        }
    }

    /// Run the compiled script once, right now
    pub async fn execute(&self) {
        let Some(script) = self.compiled() else {
            warn!(schedule = %self.id, "Schedule has no compiled script");
            return;
        };
        let mut ctx = ScriptContext::new(Arc::clone(&self.console));
        if let Err(e) = script.unit.invoke(MAIN_ROUTINE, &mut ctx).await {
            error!(schedule = %self.id, error = %e, "Schedule execution failed");
        }
    }

    /// Apply an updated configuration node.
    ///
    /// A node that no longer parses is rejected and the previous
    /// configuration stays in effect.
    pub fn contrast(&self, table: toml::Table) -> ScheduleChanges {
        let config: ScheduleConfig = match ConfigNode::new(table.clone()).parse(KIND, &self.id) {
            Ok(config) => config,
            Err(e) => {
                warn!(schedule = %self.id, error = %e, "Rejected configuration update");
                return ScheduleChanges::default();
            }
        };

        let changed = {
            let mut state = self.state.lock();
            let changed = state.node.update_source(table);
            let resolved = resolve(&self.id, &config, &self.default_date_format);
            state.config = config;
            state.timing = resolved.timing;
            state.invalid = resolved.invalid;
            state.date_format = resolved.date_format;
            changed
        };

        let changes = ScheduleChanges::from_keys(&changed);
        if changes.recompile {
            let _ = self.compile_script();
        }
        if changes.restart {
            self.run();
        }
        if changes.recompile || changes.restart {
            debug!(schedule = %self.id, ?changed, "Schedule updated");
        }
        changes
    }

    fn job(&self) -> Job {
        let this = self.this.clone();
        Arc::new(move || -> Option<BoxFuture<'static, ()>> {
            let task = this.upgrade()?;
            let timing = task.timing();
            if timing.is_expired(task.clock.now_millis()) {
                info!(schedule = %task.id, "Schedule has completed");
                return None;
            }
            debug!(schedule = %task.id, "Schedule running");
            Some(Box::pin(async move { task.execute().await }))
        })
    }
}

struct Resolved {
    timing: Timing,
    invalid: Option<ScheduleError>,
    date_format: String,
}

/// Resolve timing from a configuration, logging values that do not parse
fn resolve(id: &str, config: &ScheduleConfig, default_date_format: &str) -> Resolved {
    let date_format = config
        .date_format
        .clone()
        .unwrap_or_else(|| default_date_format.to_string());

    let instant = |key: &str, value: &Option<String>| -> i64 {
        let Some(text) = value else {
            return UNSET;
        };
        timing::parse_instant(text, &date_format).unwrap_or_else(|| {
            warn!(schedule = id, key, value = %text, format = %date_format, "Unparsable time, ignoring");
            UNSET
        })
    };

    let (period_ms, invalid) = match config.period.as_deref().map(timing::parse_period) {
        None => (0, None),
        Some(Ok(ms)) => (ms, None),
        Some(Err(e)) => {
            warn!(schedule = id, error = %e, "Invalid period");
            (0, Some(e))
        }
    };

    Resolved {
        timing: Timing {
            start: instant("start", &config.start),
            end: instant("end", &config.end),
            period_ms,
            is_async: config.is_async,
        },
        invalid,
        date_format,
    }
}

impl ScriptCompiler for ScheduleTask {
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
        let body = match &state.config.execute {
            Some(execute) => execute.0.clone(),
            None => format!("print *\"schedule {} has no execution\"", self.id.replace('"', "\\\"")),
        };
        AssembledSource {
            text: assembler::routine(MAIN_ROUTINE, &body),
            namespaces: state.config.namespace.0.clone(),
            entries: vec![Entry::new(&self.id, MAIN_ROUTINE)],
        }
    }
}

impl Managed for ScheduleTask {
    type Env = ScheduleEnv;
    const KIND: &'static str = KIND;

    fn create(id: &str, path: &Path, node: ConfigNode, env: &ScheduleEnv) -> Result<Arc<Self>, ConfigError> {
        ScheduleTask::new(id, path, node, env)
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn contrast(self: &Arc<Self>, table: toml::Table, _env: &ScheduleEnv) {
        ScheduleTask::contrast(self, table);
    }

    fn retire(&self, _env: &ScheduleEnv) {
        self.terminate();
    }

    fn activate(self: &Arc<Self>, env: &ScheduleEnv) {
        if env.is_active() {
            self.run();
        }
    }

    fn loaded(env: &ScheduleEnv, entities: &[Arc<Self>]) {
        if env.is_active() {
            for task in entities {
                task.run();
            }
        }
    }
}

impl std::fmt::Debug for ScheduleTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleTask").field("id", &self.id).finish()
    }
}
