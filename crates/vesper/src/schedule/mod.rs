//! Schedules
//!
//! Scripted executions fired once or periodically between optional start and
//! end instants, restarted in place when their configuration changes.

mod task;
mod timer;
mod timing;

pub use task::*;
pub use timer::*;
pub use timing::*;

use std::sync::atomic::Ordering;

use tracing::info;

use crate::project::ConfigSync;

impl ConfigSync<ScheduleTask> {
    /// Start every task; tasks created later start immediately
    pub fn start_all(&self) {
        self.env().active.store(true, Ordering::Release);
        let tasks = self.registry().list();
        for task in &tasks {
            task.run();
        }
        info!(count = tasks.len(), "Started schedules");
    }

    /// Terminate every task
    pub fn shutdown(&self) {
        self.env().active.store(false, Ordering::Release);
        for task in self.registry().list() {
            task.terminate();
        }
        info!("Schedules stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ScriptCompiler;
    use crate::project::{ConfigNode, DEFAULT_DATE_FORMAT};
    use parking_lot::RwLock;
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use vesper_script::{CapturedConsole, ReferenceEngine};

    const T0: i64 = 1_700_000_000_000;

    /// Wall clock that follows tokio's (possibly paused) time
    struct TokioClock {
        base: i64,
        origin: tokio::time::Instant,
    }

    impl TokioClock {
        fn starting_at(base: i64) -> Self {
            Self {
                base,
                origin: tokio::time::Instant::now(),
            }
        }
    }

    impl Clock for TokioClock {
        fn now_millis(&self) -> i64 {
            self.base + self.origin.elapsed().as_millis() as i64
        }
    }

    fn env(now: i64, console: &Arc<CapturedConsole>) -> ScheduleEnv {
        ScheduleEnv {
            engine: Arc::new(ReferenceEngine::new()),
            timer: Arc::new(TokioTimer),
            clock: Arc::new(TokioClock::starting_at(now)),
            console: console.clone(),
            date_format: RwLock::new(DEFAULT_DATE_FORMAT.to_string()),
            active: AtomicBool::new(false),
        }
    }

    fn at(millis: i64) -> String {
        format_instant(millis, DEFAULT_DATE_FORMAT)
    }

    fn task(id: &str, config: &str, env: &ScheduleEnv) -> Arc<ScheduleTask> {
        let node = ConfigNode::new(config.parse().unwrap());
        ScheduleTask::new(id, Path::new("schedules/test.toml"), node, env).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_until_end() {
        let console = Arc::new(CapturedConsole::default());
        let env = env(T0, &console);
        let config = format!(
            "start = \"{}\"\nend = \"{}\"\nperiod = \"1s\"\nexecute = 'print *tick'",
            at(T0 + 1000),
            at(T0 + 4000)
        );
        let task = task("ticker", &config, &env);

        task.run();
        assert!(task.is_running());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(console.lines().is_empty());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(console.lines(), vec!["tick", "tick", "tick"]);
        assert!(!task.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_catch_up_waits_for_next_grid_point() {
        let console = Arc::new(CapturedConsole::default());
        let env = env(T0 + 2500, &console);
        let config = format!("start = \"{}\"\nperiod = \"1s\"\nexecute = 'print *tick'", at(T0));
        let task = task("grid", &config, &env);

        task.run();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(console.lines().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(console.lines(), vec!["tick"]);
        task.terminate();
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_without_start_fires_now() {
        let console = Arc::new(CapturedConsole::default());
        let env = env(T0, &console);
        let task = task("once", "execute = ['print *a', 'print *b']", &env);

        task.run();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(console.lines(), vec!["a", "b"]);
        assert!(!task.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_execute_reports() {
        let console = Arc::new(CapturedConsole::default());
        let env = env(T0, &console);
        let task = task("empty", "async = true", &env);

        task.execute().await;
        assert_eq!(console.lines(), vec!["schedule empty has no execution"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_and_invalid_do_not_start() {
        let console = Arc::new(CapturedConsole::default());
        let env = env(T0, &console);

        let expired = task("old", &format!("end = \"{}\"\nexecute = 'print 1'", at(T0 - 1000)), &env);
        expired.run();
        assert!(!expired.is_running());

        let invalid = task("loose", "period = \"5m\"\nexecute = 'print 1'", &env);
        assert_eq!(invalid.timing().period_ms, 300_000);
        invalid.run();
        assert!(!invalid.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_before_epoch_runs_on_grid() {
        let console = Arc::new(CapturedConsole::default());
        let env = env(T0, &console);
        let task = task(
            "ancient",
            "start = \"1969-12-31 00:00:00\"\nperiod = \"1s\"\nexecute = 'print *tick'",
            &env,
        );
        assert!(task.timing().start < 0);

        task.run();
        assert!(task.is_running());
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(console.lines(), vec!["tick"]);
        task.terminate();
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_period_stops_task() {
        let console = Arc::new(CapturedConsole::default());
        let env = env(T0, &console);
        let config = format!("start = \"{}\"\nperiod = \"1s\"\nexecute = 'print 1'", at(T0));
        let task = task("huge", &config, &env);
        task.run();
        assert!(task.is_running());

        let changes = task.contrast(config.replace("\"1s\"", "\"300000000000d\"").parse().unwrap());
        assert!(changes.restart);
        assert!(!task.is_running());

        let changes = task.contrast(config.replace("\"1s\"", "\"never\"").parse().unwrap());
        assert!(changes.restart);
        assert!(!task.is_running());

        task.contrast(config.parse().unwrap());
        assert!(task.is_running());
        task.terminate();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unparsable_start_is_unset() {
        let console = Arc::new(CapturedConsole::default());
        let env = env(T0, &console);
        let task = task("bad", "start = \"next tuesday\"\nexecute = 'print 1'", &env);
        assert_eq!(task.timing().start, UNSET);
    }

    #[tokio::test(start_paused = true)]
    async fn test_contrast_recompile_keeps_timer() {
        let console = Arc::new(CapturedConsole::default());
        let env = env(T0, &console);
        let config = format!("start = \"{}\"\nperiod = \"1s\"\nexecute = 'print *old'", at(T0 + 1000));
        let task = task("swap", &config, &env);
        task.run();

        let updated = config.replace("*old", "*new");
        let changes = task.contrast(updated.parse().unwrap());
        assert_eq!(
            changes,
            ScheduleChanges {
                recompile: true,
                restart: false
            }
        );
        assert!(task.is_running());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(console.lines(), vec!["new"]);
        task.terminate();
    }

    #[tokio::test(start_paused = true)]
    async fn test_contrast_timing_restarts() {
        let console = Arc::new(CapturedConsole::default());
        let env = env(T0, &console);
        let task = task("later", &format!("start = \"{}\"\nexecute = 'print *go'", at(T0 + 60_000)), &env);
        task.run();

        let changes = task.contrast(format!("start = \"{}\"\nexecute = 'print *go'", at(T0 + 1000)).parse().unwrap());
        assert!(changes.restart && !changes.recompile);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(console.lines(), vec!["go"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_compile_keeps_previous() {
        let console = Arc::new(CapturedConsole::default());
        let env = env(T0, &console);
        let task = task("keep", "execute = 'print *kept'", &env);
        let before = task.compiled().unwrap();

        task.contrast("execute = 'print'".parse().unwrap());
        assert!(Arc::ptr_eq(&before, &task.compiled().unwrap()));

        task.execute().await;
        assert_eq!(console.lines(), vec!["kept"]);
    }

    #[test]
    fn test_schedule_changes_from_keys() {
        assert!(ScheduleChanges::from_keys(&["date-format"]).restart);
        assert!(ScheduleChanges::from_keys(&["period"]).restart);
        assert!(ScheduleChanges::from_keys(&["execute"]).recompile);
        assert_eq!(ScheduleChanges::from_keys(&["disable"]), ScheduleChanges::default());
    }
}
