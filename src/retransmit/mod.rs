//! Retransmission engine
//!
//! Tracks, for one original sender, the seqno ranges still missing locally
//! and periodically asks for them again:
//! - `add(low, high)` registers a missing range, merging it with any
//!   overlapping or adjacent range already tracked
//! - `remove(seqno)` marks one seqno as received; a range whose bitmap is
//!   complete is dropped and its timer cancelled
//! - every range has its own timer and its own copy of the interval
//!   strategy; each firing asks for the still-missing sub-ranges and
//!   schedules the next firing with the next delay
//! - `stop()` waits for in-flight callbacks, then cancels everything; no
//!   callback starts after `stop()` returns

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use crate::address::Address;
use crate::sync::{lock, read, write};
use crate::timer::{Scheduler, TaskHandle};
use crate::window::{Interval, Range, Seqno, SeqnoRange};

/// Callback asking `originator` to resend `[low, high]`.
pub type RetransmitCommand = Arc<dyn Fn(u64, u64, &Address) + Send + Sync>;

struct Pending {
    id: u64,
    range: SeqnoRange,
    interval: Interval,
    handle: TaskHandle,
}

#[derive(Default)]
struct State {
    pending: BTreeMap<Seqno, Pending>,
    next_id: u64,
}

struct Inner {
    sender: Address,
    command: RetransmitCommand,
    scheduler: Arc<dyn Scheduler>,
    interval: Interval,
    state: Mutex<State>,
    running: RwLock<bool>,
}

/// Outstanding missing ranges for one sender, re-requested on a backoff.
#[derive(Clone)]
pub struct Retransmitter {
    inner: Arc<Inner>,
}

impl Retransmitter {
    pub fn new(
        sender: Address,
        interval: Interval,
        scheduler: Arc<dyn Scheduler>,
        command: RetransmitCommand,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sender,
                command,
                scheduler,
                interval,
                state: Mutex::new(State::default()),
                running: RwLock::new(true),
            }),
        }
    }

    /// The sender whose messages are being recovered.
    pub fn sender(&self) -> &Address {
        &self.inner.sender
    }

    /// Track `[low, high]` as missing.
    pub fn add(&self, low: u64, high: u64) {
        if low > high || !*read(&self.inner.running) {
            return;
        }
        let mut state = lock(&self.inner.state);

        // Collect every tracked range that overlaps or touches [low, high].
        let touching: Vec<Seqno> = state
            .pending
            .range(..=Seqno::single(high.saturating_add(1)))
            .rev()
            .take_while(|(k, _)| k.high().saturating_add(1) >= low)
            .map(|(k, _)| *k)
            .collect();

        let mut merged_low = low;
        let mut merged_high = high;
        let mut old = Vec::with_capacity(touching.len());
        for key in touching {
            if let Some(p) = state.pending.remove(&key) {
                p.handle.cancel();
                merged_low = merged_low.min(p.range.low());
                merged_high = merged_high.max(p.range.high());
                old.push(p.range);
            }
        }

        let Ok(mut range) = SeqnoRange::new(merged_low, merged_high) else {
            return;
        };
        // Seqnos already received in the old ranges stay received, unless
        // the new request explicitly names them as missing again.
        for r in &old {
            for s in r.low()..=r.high() {
                if r.get(s) && !(low <= s && s <= high) {
                    range.set(s);
                }
            }
        }

        let id = state.next_id;
        state.next_id += 1;
        let mut interval = self.inner.interval.fresh();
        let delay = interval.next();
        let handle = schedule_fire(&self.inner, id, merged_low, delay);
        state.pending.insert(
            Seqno::range(merged_low, merged_high),
            Pending {
                id,
                range,
                interval,
                handle,
            },
        );
    }

    /// Mark `seqno` as received. No-op if it is not tracked.
    pub fn remove(&self, seqno: u64) {
        let mut state = lock(&self.inner.state);
        let key = Seqno::dummy(seqno);
        let done = match state.pending.get_mut(&key) {
            Some(p) => {
                p.range.set(seqno);
                p.range.missing_count() == 0
            }
            None => false,
        };
        if done {
            if let Some(p) = state.pending.remove(&key) {
                p.handle.cancel();
            }
        }
    }

    /// Number of seqnos still missing.
    pub fn size(&self) -> u64 {
        lock(&self.inner.state)
            .pending
            .values()
            .map(|p| p.range.missing_count())
            .sum()
    }

    /// Missing sub-ranges, in order.
    pub fn missing(&self) -> Vec<Range> {
        lock(&self.inner.state)
            .pending
            .values()
            .flat_map(|p| p.range.missing_ranges())
            .collect()
    }

    /// Cancel every pending request and stop accepting new ones.
    pub fn stop(&self) {
        let mut running = write(&self.inner.running);
        *running = false;
        self.clear();
    }

    /// Cancel every pending request but keep running.
    pub fn reset(&self) {
        self.clear();
    }

    fn clear(&self) {
        let mut state = lock(&self.inner.state);
        for (_, p) in std::mem::take(&mut state.pending) {
            p.handle.cancel();
        }
    }
}

fn schedule_fire(inner: &Arc<Inner>, id: u64, key_low: u64, delay: Duration) -> TaskHandle {
    let weak: Weak<Inner> = Arc::downgrade(inner);
    inner.scheduler.schedule(
        delay,
        Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                fire(&inner, id, key_low);
            }
        }),
    )
}

fn fire(inner: &Arc<Inner>, id: u64, key_low: u64) {
    // Callbacks run under the read side; stop() takes the write side.
    let running = read(&inner.running);
    if !*running {
        return;
    }
    let missing = {
        let mut state = lock(&inner.state);
        let key = Seqno::dummy(key_low);
        let Some(p) = state.pending.get_mut(&key) else {
            return;
        };
        if p.id != id {
            return;
        }
        let delay = p.interval.next();
        let missing = p.range.missing_ranges();
        p.handle = schedule_fire(inner, id, key_low, delay);
        missing
    };
    for r in missing {
        (inner.command)(r.low, r.high, &inner.sender);
    }
}

impl std::fmt::Debug for Retransmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retransmitter")
            .field("sender", &self.inner.sender)
            .field("missing", &self.size())
            .finish()
    }
}
