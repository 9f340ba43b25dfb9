// Timer - Delayed and periodic job submission on the tokio runtime

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// A firing of a timer job.
///
/// Returning `None` stops the timer; `Some` is the work for this firing.
pub type Job = Arc<dyn Fn() -> Option<BoxFuture<'static, ()>> + Send + Sync>;

/// How a job should be scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSpec {
    /// Run each firing in the background instead of waiting for it
    pub is_async: bool,
    pub delay: Duration,
    /// Repeat interval, `None` for a single firing
    pub period: Option<Duration>,
}

/// Handle to a submitted timer
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Stop future firings. Work already handed off keeps running.
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Platform timer abstraction
pub trait TimerExecutor: Send + Sync {
    fn submit(&self, spec: TimerSpec, job: Job) -> TimerHandle;
}

/// [`TimerExecutor`] backed by the current tokio runtime
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

impl TimerExecutor for TokioTimer {
    fn submit(&self, spec: TimerSpec, job: Job) -> TimerHandle {
        let task = tokio::spawn(async move {
            tokio::time::sleep(spec.delay).await;

            let mut ticker = spec.period.map(|period| {
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                interval
            });

            loop {
                let Some(work) = job() else {
                    break;
                };

                // Each firing runs as its own task so cancelling the timer
                // never interrupts a firing already underway
                let running = tokio::spawn(work);
                if !spec.is_async {
                    let _ = running.await;
                }

                match ticker.as_mut() {
                    Some(interval) => {
                        interval.tick().await;
                    }
                    None => break,
                }
            }
        });
        TimerHandle { task }
    }
}
