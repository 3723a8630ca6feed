//! Condition variable bound to the state it guards.
//!
//! Waiters pass a predicate over the state and an optional timeout; the
//! predicate is re-checked after every wakeup, so spurious wakeups and
//! notifications for unrelated changes are harmless.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::lock;

/// State guarded by a mutex plus a condition variable signalled on change.
#[derive(Debug, Default)]
pub struct CondVar<T> {
    state: Mutex<T>,
    cond: Condvar,
}

impl<T> CondVar<T> {
    pub fn new(state: T) -> Self {
        Self {
            state: Mutex::new(state),
            cond: Condvar::new(),
        }
    }

    /// Lock the state without notifying anyone.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        lock(&self.state)
    }

    /// Mutate the state and wake all waiters.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = {
            let mut guard = lock(&self.state);
            f(&mut guard)
        };
        self.cond.notify_all();
        result
    }

    /// Wake all waiters so they re-check their predicates.
    pub fn notify_all(&self) {
        self.cond.notify_all();
    }

    /// Block until `pred` holds or the timeout elapses.
    ///
    /// Returns whether the predicate held on return. `None` waits forever.
    pub fn wait_for(&self, mut pred: impl FnMut(&T) -> bool, timeout: Option<Duration>) -> bool {
        let guard = lock(&self.state);
        match timeout {
            None => {
                let guard = self
                    .cond
                    .wait_while(guard, |s| !pred(s))
                    .unwrap_or_else(|e| e.into_inner());
                pred(&guard)
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                let mut guard = guard;
                loop {
                    if pred(&guard) {
                        return true;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (g, _) = self
                        .cond
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    guard = g;
                }
            }
        }
    }

    /// Like `wait_for`, then apply `f` to the state under the same lock.
    pub fn wait_then<R>(
        &self,
        pred: impl FnMut(&T) -> bool,
        timeout: Option<Duration>,
        f: impl FnOnce(&mut T, bool) -> R,
    ) -> R {
        let mut pred = pred;
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = lock(&self.state);
        loop {
            if pred(&guard) {
                return f(&mut guard, true);
            }
            match deadline {
                None => {
                    guard = self.cond.wait(guard).unwrap_or_else(|e| e.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return f(&mut guard, false);
                    }
                    let (g, _) = self
                        .cond
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    guard = g;
                }
            }
        }
    }
}
