//! One-shot result handoff between threads.

use std::time::Duration;

use super::condvar::CondVar;

/// A result that one thread sets and others wait for.
#[derive(Debug)]
pub struct Promise<T> {
    result: CondVar<Option<T>>,
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Self {
            result: CondVar::new(None),
        }
    }

    /// Set the result and wake waiters. A later set replaces an unread result.
    pub fn set_result(&self, value: T) {
        self.result.update(|r| *r = Some(value));
    }

    /// Wait up to `timeout` and take the result, leaving the promise empty.
    pub fn take_result(&self, timeout: Duration) -> Option<T> {
        self.result
            .wait_then(|r| r.is_some(), Some(timeout), |r, _| r.take())
    }

    pub fn has_result(&self) -> bool {
        self.result.lock().is_some()
    }

    /// Drop any unread result.
    pub fn reset(&self) {
        self.result.update(|r| *r = None);
    }
}

impl<T: Clone> Promise<T> {
    /// Wait up to `timeout` for the result without consuming it.
    pub fn get_result(&self, timeout: Duration) -> Option<T> {
        self.result
            .wait_then(|r| r.is_some(), Some(timeout), |r, _| r.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_result_from_other_thread() {
        let p = Arc::new(Promise::new());
        let p2 = Arc::clone(&p);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            p2.set_result(42);
        });
        assert_eq!(p.get_result(Duration::from_secs(5)), Some(42));
        assert!(p.has_result());
        assert_eq!(p.take_result(Duration::from_millis(1)), Some(42));
        assert!(!p.has_result());
    }

    #[test]
    fn test_timeout_returns_none() {
        let p: Promise<u32> = Promise::new();
        assert_eq!(p.take_result(Duration::from_millis(20)), None);
    }
}
