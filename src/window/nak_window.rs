//! Per-sender receive window for reliable multicast
//!
//! Tracks three marks for one sender:
//! - `low`: highest seqno purged as stable
//! - `highest_delivered`: everything up to here was removed in order
//! - `highest_received`: highest seqno seen, possibly with gaps below it
//!
//! Invariant: `low <= highest_delivered <= highest_received`.
//!
//! Delivered messages stay in the table until `stable()` purges them, so the
//! window can still answer retransmission requests for them.

use super::errors::WindowResult;
use super::retransmit_table::RetransmitTable;
use super::seqno::Range;
use crate::view::DigestEntry;

/// Outcome of adding a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddResult {
    /// Stored. `gap` is the newly detected missing range, if the seqno
    /// jumped past `highest_received + 1`.
    Added { gap: Option<Range> },
    /// Already delivered or already buffered.
    Duplicate,
    /// Below the stable point; can never be stored again.
    Stale,
}

impl AddResult {
    pub fn is_added(&self) -> bool {
        matches!(self, Self::Added { .. })
    }
}

/// Counters kept per window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowStats {
    /// Messages accepted.
    pub received: u64,
    /// Messages rejected as duplicate or stale.
    pub duplicates: u64,
    /// Seqnos detected as missing.
    pub missing_detected: u64,
    /// Accepted messages that filled a previously detected gap.
    pub retransmitted: u64,
}

/// Gap-aware receive window for one sender.
#[derive(Debug)]
pub struct NakReceiverWindow<T> {
    table: RetransmitTable<T>,
    low: u64,
    highest_delivered: u64,
    highest_received: u64,
    stats: WindowStats,
    destroyed: bool,
}

impl<T: Clone> NakReceiverWindow<T> {
    /// Create a window where everything up to `highest_delivered` is
    /// considered delivered and purged.
    pub fn new(
        highest_delivered: u64,
        rows: usize,
        row_len: usize,
        resize_factor: f64,
    ) -> WindowResult<Self> {
        Self::from_entry(
            &DigestEntry::new(highest_delivered, highest_delivered, highest_delivered),
            rows,
            row_len,
            resize_factor,
        )
    }

    /// Create an empty window carrying the marks of `entry`. Seqnos in
    /// `(highest_delivered, highest_received]` are reported missing.
    pub fn from_entry(
        entry: &DigestEntry,
        rows: usize,
        row_len: usize,
        resize_factor: f64,
    ) -> WindowResult<Self> {
        let highest_delivered = entry.highest_delivered;
        let table = RetransmitTable::new(rows, row_len, highest_delivered + 1, resize_factor)?;
        Ok(Self {
            table,
            low: entry.low.min(highest_delivered),
            highest_delivered,
            highest_received: entry.highest_received.max(highest_delivered),
            stats: WindowStats::default(),
            destroyed: false,
        })
    }

    /// Store a message.
    pub fn add(&mut self, seqno: u64, msg: T) -> AddResult {
        if self.destroyed || seqno <= self.table.highest_purged() {
            self.stats.duplicates += 1;
            return AddResult::Stale;
        }
        if seqno <= self.highest_delivered || !self.table.put(seqno, msg) {
            self.stats.duplicates += 1;
            return AddResult::Duplicate;
        }

        self.stats.received += 1;
        let gap = if seqno > self.highest_received + 1 {
            let gap = Range::new(self.highest_received + 1, seqno - 1);
            self.stats.missing_detected += gap.count();
            Some(gap)
        } else {
            None
        };
        if seqno < self.highest_received {
            self.stats.retransmitted += 1;
        }
        self.highest_received = self.highest_received.max(seqno);
        AddResult::Added { gap }
    }

    /// Remove the next message in order, if present. The message stays in
    /// the table for retransmission until it becomes stable.
    pub fn remove(&mut self) -> Option<T> {
        let next = self.highest_delivered + 1;
        let msg = self.table.get(next)?.clone();
        self.highest_delivered = next;
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

    pub fn get(&self, seqno: u64) -> Option<&T> {
        self.table.get(seqno)
    }

    /// Present messages in `[low, high]`, in order.
    pub fn get_range(&self, low: u64, high: u64) -> Vec<T> {
        (low..=high).filter_map(|s| self.table.get(s).cloned()).collect()
    }

    /// Purge delivered messages up to `seqno`. Never purges past
    /// `highest_delivered`.
    pub fn stable(&mut self, seqno: u64) {
        let upto = seqno.min(self.highest_delivered);
        self.low = self.low.max(upto);
        if upto > self.table.highest_purged() {
            self.table.purge(upto);
        }
    }

    pub fn digest_entry(&self) -> DigestEntry {
        DigestEntry::new(
            self.low,
            self.highest_delivered,
            self.highest_received,
        )
    }

    /// Seqnos missing between `highest_delivered` and `highest_received`.
    pub fn missing(&self) -> Vec<Range> {
        let mut gaps = Vec::new();
        let mut start: Option<u64> = None;
        for s in self.highest_delivered + 1..=self.highest_received {
            match (self.table.get(s).is_some(), start) {
                (false, None) => start = Some(s),
                (true, Some(first)) => {
                    gaps.push(Range::new(first, s - 1));
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(first) = start {
            gaps.push(Range::new(first, self.highest_received));
        }
        gaps
    }

    pub fn has_messages_to_remove(&self) -> bool {
        self.table.get(self.highest_delivered + 1).is_some()
    }

    pub fn highest_delivered(&self) -> u64 {
        self.highest_delivered
    }

    pub fn highest_received(&self) -> u64 {
        self.highest_received
    }

    pub fn low(&self) -> u64 {
        self.low
    }

    /// Messages held (delivered but not yet stable, plus buffered).
    pub fn size(&self) -> usize {
        self.table.size()
    }

    /// Buffered messages not yet delivered.
    pub fn undelivered(&self) -> usize {
        (self.highest_delivered + 1..=self.highest_received)
            .filter(|s| self.table.get(*s).is_some())
            .count()
    }

    pub fn stats(&self) -> WindowStats {
        self.stats
    }

    /// Fraction of seqnos that had to be recovered.
    pub fn loss_rate(&self) -> f64 {
        let total = self.stats.received + self.stats.missing_detected;
        if total == 0 {
            0.0
        } else {
            self.stats.missing_detected as f64 / total as f64
        }
    }

    /// Drop every message; later adds are rejected.
    pub fn destroy(&mut self) {
        self.destroyed = true;
        let top = self.highest_received.max(self.highest_delivered);
        self.table.purge(top);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Total weight of held messages.
    pub fn size_of_all_messages(&self, size_of: impl Fn(&T) -> usize) -> usize {
        self.table.size_of_all_messages(size_of)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> NakReceiverWindow<u64> {
        NakReceiverWindow::new(0, 3, 10, 1.2).unwrap()
    }

    #[test]
    fn test_in_order_delivery() {
        let mut w = window();
        for s in 1..=3 {
            assert_eq!(w.add(s, s), AddResult::Added { gap: None });
        }
        assert_eq!(w.remove_many(10), vec![1, 2, 3]);
        assert_eq!(w.highest_delivered(), 3);
        assert_eq!(w.remove(), None);
    }

    #[test]
    fn test_gap_detected_and_filled() {
        let mut w = window();
        w.add(1, 1);
        assert_eq!(
            w.add(4, 4),
            AddResult::Added {
                gap: Some(Range::new(2, 3))
            }
        );
        assert_eq!(w.remove(), Some(1));
        assert_eq!(w.remove(), None);
        assert_eq!(w.missing(), vec![Range::new(2, 3)]);

        w.add(3, 3);
        assert_eq!(w.missing(), vec![Range::new(2, 2)]);
        w.add(2, 2);
        assert!(w.missing().is_empty());
        assert_eq!(w.remove_many(10), vec![2, 3, 4]);

        let stats = w.stats();
        assert_eq!(stats.missing_detected, 2);
        assert_eq!(stats.retransmitted, 2);
        assert!((w.loss_rate() - 2.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut w = window();
        assert!(w.add(1, 1).is_added());
        assert_eq!(w.add(1, 1), AddResult::Duplicate);
        assert!(w.add(3, 3).is_added());
        assert_eq!(w.add(3, 3), AddResult::Duplicate);
        assert_eq!(w.size(), 2);
        w.remove();
        assert_eq!(w.add(1, 1), AddResult::Duplicate);
        assert_eq!(w.stats().duplicates, 3);
    }

    #[test]
    fn test_stable_purges_only_delivered() {
        let mut w = window();
        for s in 1..=5 {
            w.add(s, s);
        }
        w.remove_many(3);
        w.stable(10);
        assert_eq!(w.low(), 3);
        assert!(w.get(3).is_none());
        assert_eq!(w.get(4), Some(&4));
        assert_eq!(w.add(2, 2), AddResult::Stale);
        assert_eq!(w.digest_entry(), DigestEntry::new(3, 3, 5));
    }

    #[test]
    fn test_get_range_skips_missing() {
        let mut w = window();
        for s in [1, 2, 4] {
            w.add(s, s);
        }
        assert_eq!(w.get_range(1, 4), vec![1, 2, 4]);
    }

    #[test]
    fn test_initial_seqno() {
        let mut w: NakReceiverWindow<u64> = NakReceiverWindow::new(10, 3, 10, 1.2).unwrap();
        assert_eq!(w.add(10, 10), AddResult::Stale);
        assert!(w.add(11, 11).is_added());
        assert_eq!(w.remove(), Some(11));
        assert_eq!(w.digest_entry(), DigestEntry::new(10, 11, 11));
    }

    #[test]
    fn test_from_entry_keeps_marks_and_reports_gap() {
        let entry = DigestEntry::new(1, 5, 8);
        let mut w: NakReceiverWindow<u64> = NakReceiverWindow::from_entry(&entry, 3, 10, 1.2).unwrap();
        assert_eq!(w.digest_entry(), entry);
        assert_eq!(w.missing(), vec![Range::new(6, 8)]);
        assert_eq!(w.add(5, 5), AddResult::Stale);
        assert_eq!(w.add(7, 7), AddResult::Added { gap: None });
        assert!(w.add(6, 6).is_added());
        assert_eq!(w.remove_many(10), vec![6, 7]);
        assert_eq!(w.digest_entry(), DigestEntry::new(1, 7, 8));

        w.stable(6);
        assert_eq!(w.low(), 6);
    }

    #[test]
    fn test_destroy() {
        let mut w = window();
        w.add(1, 1);
        w.add(2, 2);
        w.destroy();
        assert!(w.is_destroyed());
        assert_eq!(w.size(), 0);
        assert!(!w.add(3, 3).is_added());
    }
}
