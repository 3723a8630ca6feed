//! Synchronization helpers
//!
//! - `CondVar`: state + condition variable with predicate waits and timeouts
//! - `Promise`: one-shot result handoff with timeout
//! - `Drainer` / `DrainQueue`: concurrent producers, one consumer at a time
//! - `wait_until`: bounded polling for tests and shutdown paths
//!
//! Every blocking call here takes a timeout and reports expiry as `false` or
//! `None`; nothing panics on a poisoned lock.

mod condvar;
mod drain;
mod promise;

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

pub use condvar::CondVar;
pub use drain::{DrainQueue, Drainer};
pub use promise::Promise;

/// Lock a mutex, recovering the guard if a holder panicked.
pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Read-lock, recovering from poisoning.
pub fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|e| e.into_inner())
}

/// Write-lock, recovering from poisoning.
pub fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|e| e.into_inner())
}

/// Poll `pred` every `interval` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, interval: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if pred() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_wait_until() {
        let n = AtomicU32::new(0);
        assert!(wait_until(Duration::from_secs(1), Duration::from_millis(1), || {
            n.fetch_add(1, Ordering::Relaxed) >= 3
        }));
        assert!(!wait_until(
            Duration::from_millis(20),
            Duration::from_millis(5),
            || false
        ));
    }
}
