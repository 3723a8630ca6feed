//! Cancellation handle for scheduled tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::sync::lock;

#[derive(Debug, Default)]
struct HandleState {
    cancelled: AtomicBool,
    done: AtomicBool,
    abort: Mutex<Option<tokio::task::AbortHandle>>,
}

/// Handle to a scheduled task. Cancelling twice is harmless.
#[derive(Debug, Clone, Default)]
pub struct TaskHandle {
    state: Arc<HandleState>,
}

impl TaskHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prevent any further runs of the task.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
        if let Some(abort) = lock(&self.state.abort).take() {
            abort.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Whether a one-shot task has run (or was cancelled).
    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.state.done.load(Ordering::Acquire)
    }

    pub(crate) fn mark_done(&self) {
        self.state.done.store(true, Ordering::Release);
    }

    pub(crate) fn set_abort(&self, abort: tokio::task::AbortHandle) {
        if self.is_cancelled() {
            abort.abort();
            return;
        }
        *lock(&self.state.abort) = Some(abort);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_idempotent() {
        let h = TaskHandle::new();
        assert!(!h.is_done());
        h.cancel();
        h.cancel();
        assert!(h.is_cancelled());
        assert!(h.is_done());
    }

    #[test]
    fn test_clones_share_state() {
        let h = TaskHandle::new();
        let h2 = h.clone();
        h2.mark_done();
        assert!(h.is_done());
        assert!(!h.is_cancelled());
    }
}
