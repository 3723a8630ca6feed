//! Virtual-time scheduler for deterministic tests.
//!
//! Nothing runs until the test calls `advance` or `run_pending`. Tasks run on
//! the calling thread, in due-time order, ties broken by scheduling order.
//! Tasks scheduled while advancing run in the same call if they fall due
//! before the new time.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{OnceTask, RepeatTask, Scheduler, TaskHandle};
use crate::sync::lock;

enum Work {
    Once(OnceTask),
    Repeat(RepeatTask, Duration),
}

struct Entry {
    due: Duration,
    seq: u64,
    handle: TaskHandle,
    work: Work,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed: BinaryHeap is a max-heap and we want the earliest first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State {
    now: Duration,
    seq: u64,
    queue: BinaryHeap<Entry>,
}

/// Scheduler whose clock only moves when told to.
pub struct ManualScheduler {
    origin: Instant,
    state: Mutex<State>,
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            state: Mutex::new(State {
                now: Duration::ZERO,
                seq: 0,
                queue: BinaryHeap::new(),
            }),
        }
    }

    fn push(&self, delay: Duration, handle: TaskHandle, work: Work) {
        let mut state = lock(&self.state);
        let due = state.now + delay;
        let seq = state.seq;
        state.seq += 1;
        state.queue.push(Entry {
            due,
            seq,
            handle,
            work,
        });
    }

    /// Virtual time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        lock(&self.state).now
    }

    /// Number of live (not cancelled) queued tasks.
    pub fn pending(&self) -> usize {
        lock(&self.state)
            .queue
            .iter()
            .filter(|e| !e.handle.is_cancelled())
            .count()
    }

    /// Run everything due at the current time.
    pub fn run_pending(&self) -> usize {
        self.advance(Duration::ZERO)
    }

    /// Move the clock forward by `by`, running every task that falls due.
    /// Returns the number of task runs.
    pub fn advance(&self, by: Duration) -> usize {
        let target = lock(&self.state).now + by;
        let mut runs = 0;
        loop {
            let entry = {
                let mut state = lock(&self.state);
                match state.queue.peek() {
                    Some(e) if e.due <= target => {}
                    _ => {
                        state.now = target;
                        return runs;
                    }
                }
                let Some(entry) = state.queue.pop() else {
                    state.now = target;
                    return runs;
                };
                if entry.due > state.now {
                    state.now = entry.due;
                }
                entry
            };

            if entry.handle.is_cancelled() {
                continue;
            }
            runs += 1;
            match entry.work {
                Work::Once(task) => {
                    task();
                    entry.handle.mark_done();
                }
                Work::Repeat(task, period) => {
                    task();
                    if !entry.handle.is_cancelled() {
                        self.push(period, entry.handle, Work::Repeat(task, period));
                    }
                }
            }
        }
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: OnceTask) -> TaskHandle {
        let handle = TaskHandle::new();
        self.push(delay, handle.clone(), Work::Once(task));
        handle
    }

    fn schedule_at_fixed_rate(
        &self,
        initial: Duration,
        period: Duration,
        task: RepeatTask,
    ) -> TaskHandle {
        let handle = TaskHandle::new();
        let period = period.max(Duration::from_millis(1));
        self.push(initial, handle.clone(), Work::Repeat(task, period));
        handle
    }

    fn execute(&self, task: OnceTask) {
        self.push(Duration::ZERO, TaskHandle::new(), Work::Once(task));
    }

    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }
}
