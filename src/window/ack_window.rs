//! Receive window for one reliable unicast connection.
//!
//! Messages are stored by seqno and removed strictly in order starting at the
//! initial seqno. `remove` returning `None` means the next expected message
//! has not arrived yet; everything above it stays buffered.

use std::collections::BTreeMap;

use super::seqno::Range;

/// Store-by-seqno, remove-in-order window.
#[derive(Debug, Clone)]
pub struct AckReceiverWindow<T> {
    next_to_remove: u64,
    messages: BTreeMap<u64, T>,
}

impl<T> AckReceiverWindow<T> {
    /// Create a window whose first deliverable seqno is `initial_seqno`.
    pub fn new(initial_seqno: u64) -> Self {
        Self {
            next_to_remove: initial_seqno,
            messages: BTreeMap::new(),
        }
    }

    /// Buffer a message. Rejects seqnos already removed and duplicates.
    pub fn add(&mut self, seqno: u64, msg: T) -> bool {
        if seqno < self.next_to_remove || self.messages.contains_key(&seqno) {
            return false;
        }
        self.messages.insert(seqno, msg);
        true
    }

    /// Remove the next message in order, if it has arrived.
    pub fn remove(&mut self) -> Option<T> {
        let msg = self.messages.remove(&self.next_to_remove)?;
        self.next_to_remove += 1;
        Some(msg)
    }

    /// Remove up to `max` consecutive messages.
    pub fn remove_many(&mut self, max: usize) -> Vec<T> {
        let mut out = Vec::new();
        while out.len() < max {
            match self.remove() {
                Some(msg) => out.push(msg),
                None => break,
            }
        }
        out
    }

    /// Number of buffered messages.
    pub fn size(&self) -> usize {
        self.messages.len()
    }

    /// Whether the next expected message is present.
    pub fn has_messages_to_remove(&self) -> bool {
        self.messages.contains_key(&self.next_to_remove)
    }

    /// Seqno that `remove` will return next.
    pub fn next_to_remove(&self) -> u64 {
        self.next_to_remove
    }

    /// Highest seqno currently buffered.
    pub fn highest_received(&self) -> Option<u64> {
        self.messages.keys().next_back().copied()
    }

    /// Gaps between the removal cursor and the highest buffered seqno.
    pub fn missing(&self) -> Vec<Range> {
        let mut gaps = Vec::new();
        let mut expected = self.next_to_remove;
        for &seqno in self.messages.keys() {
            if seqno > expected {
                gaps.push(Range::new(expected, seqno - 1));
            }
            expected = seqno + 1;
        }
        gaps
    }

    /// Drop everything and restart at `initial_seqno`.
    pub fn reset(&mut self, initial_seqno: u64) {
        self.messages.clear();
        self.next_to_remove = initial_seqno;
    }
}
