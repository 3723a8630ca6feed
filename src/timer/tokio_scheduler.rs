//! Real-time scheduler backed by an owned tokio runtime.
//!
//! Tasks may block on locks and condition variables, so each run is handed
//! to the runtime's blocking pool; the async side only does the waiting.

use std::io;
use std::time::{Duration, Instant};

use tokio::runtime::{Builder, Runtime};

use super::{OnceTask, RepeatTask, Scheduler, TaskHandle};

/// Scheduler running tasks on a private multi-threaded tokio runtime.
pub struct TokioScheduler {
    runtime: Option<Runtime>,
}

impl TokioScheduler {
    /// Build a runtime with `workers` async worker threads.
    pub fn new(workers: usize) -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(workers.max(1))
            .thread_name("aerocast-timer")
            .enable_time()
            .build()?;
        Ok(Self {
            runtime: Some(runtime),
        })
    }

    fn handle(&self) -> Option<&tokio::runtime::Handle> {
        self.runtime.as_ref().map(|rt| rt.handle())
    }
}

impl std::fmt::Debug for TokioScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioScheduler")
            .field("running", &self.runtime.is_some())
            .finish()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: OnceTask) -> TaskHandle {
        let handle = TaskHandle::new();
        let Some(rt) = self.handle() else {
            handle.cancel();
            return handle;
        };
        let h = handle.clone();
        let join = rt.spawn(async move {
            tokio::time::sleep(delay).await;
            if h.is_cancelled() {
                return;
            }
            let h2 = h.clone();
            let _ = tokio::task::spawn_blocking(move || {
                if !h2.is_cancelled() {
                    task();
                }
                h2.mark_done();
            })
            .await;
        });
        handle.set_abort(join.abort_handle());
        handle
    }

    fn schedule_at_fixed_rate(
        &self,
        initial: Duration,
        period: Duration,
        task: RepeatTask,
    ) -> TaskHandle {
        let handle = TaskHandle::new();
        let Some(rt) = self.handle() else {
            handle.cancel();
            return handle;
        };
        let h = handle.clone();
        let join = rt.spawn(async move {
            let start = tokio::time::Instant::now() + initial;
            let mut ticker = tokio::time::interval_at(start, period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if h.is_cancelled() {
                    return;
                }
                let task = task.clone();
                let h2 = h.clone();
                let _ = tokio::task::spawn_blocking(move || {
                    if !h2.is_cancelled() {
                        task();
                    }
                })
                .await;
            }
        });
        handle.set_abort(join.abort_handle());
        handle
    }

    fn execute(&self, task: OnceTask) {
        if let Some(rt) = self.handle() {
            rt.spawn_blocking(task);
        }
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        if let Some(rt) = self.runtime.take() {
            rt.shutdown_background();
        }
    }
}
