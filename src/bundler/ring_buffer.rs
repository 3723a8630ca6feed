//! Bounded ring of slots with monotonic read and write indices.
//!
//! Writers block (with a timeout) while the ring is full, so a writer never
//! wraps into a slot the reader has not consumed yet. Indices only grow;
//! the slot for index `i` is `i & (capacity - 1)`.

use std::time::Duration;

use crate::sync::CondVar;
use crate::window::{WindowError, WindowResult};

struct Ring<T> {
    slots: Vec<Option<T>>,
    read: u64,
    write: u64,
    closed: bool,
}

impl<T> Ring<T> {
    fn size(&self) -> usize {
        (self.write - self.read) as usize
    }
}

/// Multi-producer ring drained by a single consumer.
pub struct RingBuffer<T> {
    ring: CondVar<Ring<T>>,
    capacity: usize,
    mask: u64,
}

impl<T> RingBuffer<T> {
    /// `capacity` must be a power of two.
    pub fn new(capacity: usize) -> WindowResult<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(WindowError::InvalidCapacity(capacity));
        }
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Ok(Self {
            ring: CondVar::new(Ring {
                slots,
                read: 0,
                write: 0,
                closed: false,
            }),
            capacity,
            mask: capacity as u64 - 1,
        })
    }

    /// Append `item`, waiting up to `timeout` for a free slot (`None` waits
    /// until space frees up or the ring is closed). The item is handed back
    /// on timeout or close.
    pub fn put(&self, item: T, timeout: Option<Duration>) -> Result<(), T> {
        let capacity = self.capacity;
        let mask = self.mask;
        let result = self.ring.wait_then(
            |r| r.closed || r.size() < capacity,
            timeout,
            move |r, ready| {
                if !ready || r.closed {
                    return Err(item);
                }
                let slot = (r.write & mask) as usize;
                r.slots[slot] = Some(item);
                r.write += 1;
                Ok(())
            },
        );
        if result.is_ok() {
            self.ring.notify_all();
        }
        result
    }

    /// Append without waiting. Hands the item back if the ring is full or
    /// closed.
    pub fn offer(&self, item: T) -> Result<(), T> {
        {
            let mut r = self.ring.lock();
            if r.closed || r.size() >= self.capacity {
                return Err(item);
            }
            let slot = (r.write & self.mask) as usize;
            r.slots[slot] = Some(item);
            r.write += 1;
        }
        self.ring.notify_all();
        Ok(())
    }

    /// Move up to `max` items into `out`, oldest first. Returns how many
    /// were moved.
    pub fn drain_to(&self, out: &mut Vec<T>, max: usize) -> usize {
        let moved = {
            let mut r = self.ring.lock();
            let n = r.size().min(max);
            for _ in 0..n {
                let slot = (r.read & self.mask) as usize;
                if let Some(item) = r.slots[slot].take() {
                    out.push(item);
                }
                r.read += 1;
            }
            n
        };
        if moved > 0 {
            self.ring.notify_all();
        }
        moved
    }

    /// Wait until there is something to read or the ring is closed.
    /// Returns whether items are available.
    pub fn wait_readable(&self, timeout: Duration) -> bool {
        self.ring
            .wait_then(|r| r.closed || r.size() > 0, Some(timeout), |r, _| {
                r.size() > 0
            })
    }

    /// Index of the next slot to read.
    pub fn read_index(&self) -> u64 {
        self.ring.lock().read
    }

    /// Index of the next slot to write.
    pub fn write_index(&self) -> u64 {
        self.ring.lock().write
    }

    /// Items written but not yet read.
    pub fn size(&self) -> usize {
        self.ring.lock().size()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Refuse further writes and release blocked writers. Unread items stay
    /// readable.
    pub fn close(&self) {
        self.ring.update(|r| r.closed = true);
    }

    pub fn is_closed(&self) -> bool {
        self.ring.lock().closed
    }
}

impl<T> std::fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let r = self.ring.lock();
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("read", &r.read)
            .field("write", &r.write)
            .finish()
    }
}
