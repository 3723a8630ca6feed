//! Single-drainer coordination
//!
//! Many threads may produce work concurrently, but only one at a time should
//! consume it. Producers bump a counter; the producer that moves it from zero
//! becomes the drainer and keeps consuming until the counter says no work
//! arrived during its last pass. Everyone else returns immediately.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::queue::SegQueue;

/// Counter-only drainer: work lives elsewhere, the drainer just runs passes.
#[derive(Debug, Default)]
pub struct Drainer {
    pending: AtomicUsize,
}

impl Drainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal new work and, if no other thread is draining, run `pass` until
    /// no further work was signalled. `pass` must consume everything visible
    /// when it runs.
    ///
    /// Returns whether this call did the draining.
    pub fn run(&self, mut pass: impl FnMut()) -> bool {
        if self.pending.fetch_add(1, Ordering::AcqRel) != 0 {
            return false;
        }
        loop {
            let seen = self.pending.load(Ordering::Acquire);
            pass();
            if self
                .pending
                .compare_exchange(seen, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Whether a drainer is active.
    pub fn is_draining(&self) -> bool {
        self.pending.load(Ordering::Acquire) != 0
    }
}

/// Queue with concurrent enqueue and single-flight dequeue-until-empty.
#[derive(Debug)]
pub struct DrainQueue<T> {
    queue: SegQueue<T>,
    pending: AtomicUsize,
}

impl<T> Default for DrainQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DrainQueue<T> {
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            pending: AtomicUsize::new(0),
        }
    }

    /// Enqueue `item`. Returns true if the caller must now call `drain`.
    pub fn add(&self, item: T) -> bool {
        // Count before publishing so a drainer never pops an uncounted item.
        let first = self.pending.fetch_add(1, Ordering::AcqRel) == 0;
        self.queue.push(item);
        first
    }

    /// Consume items until every counted item has been handled.
    pub fn drain(&self, mut handle: impl FnMut(T)) {
        loop {
            let mut handled = 0usize;
            while let Some(item) = self.queue.pop() {
                handle(item);
                handled += 1;
            }
            if handled == 0 {
                std::thread::yield_now();
                continue;
            }
            if self.pending.fetch_sub(handled, Ordering::AcqRel) == handled {
                return;
            }
        }
    }

    /// Like `drain`, but hands over everything available at once so the
    /// handler can coalesce items.
    pub fn drain_batches(&self, mut handle: impl FnMut(Vec<T>)) {
        loop {
            let mut batch = Vec::new();
            while let Some(item) = self.queue.pop() {
                batch.push(item);
            }
            if batch.is_empty() {
                std::thread::yield_now();
                continue;
            }
            let handled = batch.len();
            handle(batch);
            if self.pending.fetch_sub(handled, Ordering::AcqRel) == handled {
                return;
            }
        }
    }

    /// Items enqueued but not yet handled.
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
