//! Timers and background execution
//!
//! Protocols never spawn threads or sleep themselves. They get a `Scheduler`
//! from the stack and use it to:
//! - run a task once after a delay (retransmission, join and merge timeouts)
//! - run a task at a fixed rate (stability, tail-loss and idle sweeps)
//! - run a task concurrently right now (the membership view handler)
//!
//! Two implementations:
//! - `TokioScheduler`: real time, backed by an owned tokio runtime
//! - `ManualScheduler`: virtual time advanced explicitly, for deterministic tests

mod handle;
mod manual;
mod tokio_scheduler;

use std::sync::Arc;
use std::time::{Duration, Instant};

pub use handle::TaskHandle;
pub use manual::ManualScheduler;
pub use tokio_scheduler::TokioScheduler;

/// A task run once.
pub type OnceTask = Box<dyn FnOnce() + Send + 'static>;

/// A task run repeatedly.
pub type RepeatTask = Arc<dyn Fn() + Send + Sync + 'static>;

/// Delayed and periodic task execution.
pub trait Scheduler: Send + Sync {
    /// Run `task` once after `delay`.
    fn schedule(&self, delay: Duration, task: OnceTask) -> TaskHandle;

    /// Run `task` every `period`, first after `initial`.
    fn schedule_at_fixed_rate(
        &self,
        initial: Duration,
        period: Duration,
        task: RepeatTask,
    ) -> TaskHandle;

    /// Run `task` concurrently as soon as possible.
    fn execute(&self, task: OnceTask);

    /// Current time on this scheduler's clock.
    fn now(&self) -> Instant;
}
