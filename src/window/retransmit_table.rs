//! Retransmission table
//!
//! Dense seqno -> message store backed by a matrix of lazily allocated rows:
//! - `offset` is the seqno stored at row 0, column 0
//! - row length is rounded up to a power of two
//! - seqnos below `low` have been purged and can never be stored again
//! - the matrix grows by `resize_factor` when a seqno does not fit, after
//!   first trying to reclaim fully purged leading rows
//!
//! With automatic purging enabled, removing a seqno also purges everything
//! below it. That suits cumulative acknowledgment on the sending side.

use std::fmt;

use super::errors::{WindowError, WindowResult};

/// Sparse-by-seqno message table with a purgeable prefix.
#[derive(Clone)]
pub struct RetransmitTable<T> {
    rows: Vec<Option<Vec<Option<T>>>>,
    row_len: usize,
    initial_rows: usize,
    resize_factor: f64,
    offset: u64,
    low: u64,
    size: usize,
    highest: Option<u64>,
    automatic_purging: bool,
}

impl<T> RetransmitTable<T> {
    /// Create a table of `rows` rows of (at least) `row_len` elements, whose
    /// first storable seqno is `offset`.
    pub fn new(rows: usize, row_len: usize, offset: u64, resize_factor: f64) -> WindowResult<Self> {
        if rows == 0 || row_len == 0 {
            return Err(WindowError::InvalidDimensions { rows, row_len });
        }
        if !(resize_factor > 1.0) {
            return Err(WindowError::InvalidResizeFactor(resize_factor));
        }
        let row_len = row_len.next_power_of_two();
        Ok(Self {
            rows: (0..rows).map(|_| None).collect(),
            row_len,
            initial_rows: rows,
            resize_factor,
            offset,
            low: offset,
            size: 0,
            highest: None,
            automatic_purging: false,
        })
    }

    /// Builder-style switch for automatic purging on remove.
    pub fn with_automatic_purging(mut self, enabled: bool) -> Self {
        self.automatic_purging = enabled;
        self
    }

    fn index(&self, seqno: u64) -> (usize, usize) {
        let rel = (seqno - self.offset) as usize;
        (rel / self.row_len, rel % self.row_len)
    }

    fn slot(&self, seqno: u64) -> Option<&Option<T>> {
        if seqno < self.low {
            return None;
        }
        let (row, col) = self.index(seqno);
        self.rows.get(row)?.as_ref()?.get(col)
    }

    /// Store `msg` at `seqno`. Returns false for purged seqnos and for seqnos
    /// already present (the existing message is kept).
    pub fn put(&mut self, seqno: u64, msg: T) -> bool {
        if seqno < self.low {
            return false;
        }
        let (mut row, _) = self.index(seqno);
        if row >= self.rows.len() {
            self.resize(seqno);
            row = self.index(seqno).0;
        }
        let col = self.index(seqno).1;
        let row_len = self.row_len;
        let cells = self.rows[row].get_or_insert_with(|| (0..row_len).map(|_| None).collect());
        if cells[col].is_some() {
            return false;
        }
        cells[col] = Some(msg);
        self.size += 1;
        self.highest = Some(self.highest.map_or(seqno, |h| h.max(seqno)));
        true
    }

    pub fn get(&self, seqno: u64) -> Option<&T> {
        self.slot(seqno)?.as_ref()
    }

    /// Take the message at `seqno` out of the table.
    pub fn remove(&mut self, seqno: u64) -> Option<T> {
        if seqno < self.low {
            return None;
        }
        let (row, col) = self.index(seqno);
        let removed = self.rows.get_mut(row)?.as_mut()?.get_mut(col)?.take();
        if removed.is_some() {
            self.size -= 1;
        }
        if self.automatic_purging {
            self.purge(seqno);
        }
        removed
    }

    /// Drop every message at or below `seqno`; those seqnos can no longer be stored.
    pub fn purge(&mut self, seqno: u64) {
        if seqno < self.low {
            return;
        }
        for s in self.low..=seqno {
            let (row, col) = self.index(s);
            if row >= self.rows.len() {
                break;
            }
            if let Some(cells) = self.rows[row].as_mut() {
                if cells[col].take().is_some() {
                    self.size -= 1;
                }
            }
        }
        self.low = seqno + 1;
        // Release rows that lie completely below `low`.
        let dead_rows = ((self.low - self.offset) as usize / self.row_len).min(self.rows.len());
        for row in self.rows.iter_mut().take(dead_rows) {
            *row = None;
        }
    }

    /// Move live rows to the front so the row holding `low` becomes row 0,
    /// shrinking back towards the initial row count.
    pub fn compact(&mut self) {
        let dead_rows = ((self.low - self.offset) as usize / self.row_len).min(self.rows.len());
        if dead_rows > 0 {
            self.rows.drain(..dead_rows);
            self.offset += (dead_rows * self.row_len) as u64;
        }
        let needed = match self.highest {
            Some(h) if h >= self.offset => self.index(h).0 + 1,
            _ => 0,
        };
        let target = needed.max(self.initial_rows);
        self.rows.resize_with(target, || None);
    }

    fn resize(&mut self, seqno: u64) {
        self.compact();
        let needed = self.index(seqno).0 + 1;
        if needed <= self.rows.len() {
            return;
        }
        let grown = (self.rows.len() as f64 * self.resize_factor).ceil() as usize;
        let target = grown.max(needed);
        self.rows.resize_with(target, || None);
    }

    /// Number of stored messages.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Number of slots in the matrix.
    pub fn capacity(&self) -> usize {
        self.rows.len() * self.row_len
    }

    /// Number of rows in the matrix.
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Highest seqno ever stored.
    pub fn highest(&self) -> Option<u64> {
        self.highest
    }

    /// Highest seqno that can no longer be stored.
    pub fn highest_purged(&self) -> u64 {
        self.low.saturating_sub(1)
    }

    /// Seqno stored at row 0, column 0.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of absent seqnos in `[from, to]` above the purged prefix.
    pub fn null_count(&self, from: u64, to: u64) -> usize {
        (from.max(self.low)..=to)
            .filter(|s| self.get(*s).is_none())
            .count()
    }

    /// Total weight of stored messages as measured by `size_of`.
    pub fn size_of_all_messages(&self, size_of: impl Fn(&T) -> usize) -> usize {
        self.rows
            .iter()
            .flatten()
            .flat_map(|cells| cells.iter().flatten())
            .map(size_of)
            .sum()
    }
}

impl<T> fmt::Debug for RetransmitTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetransmitTable")
            .field("size", &self.size)
            .field("capacity", &self.capacity())
            .field("offset", &self.offset)
            .field("highest_purged", &self.highest_purged())
            .field("highest", &self.highest)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(rows: usize, row_len: usize, offset: u64) -> RetransmitTable<String> {
        RetransmitTable::new(rows, row_len, offset, 1.2).unwrap()
    }

    fn add_and_get(t: &mut RetransmitTable<String>, seqno: u64) {
        assert!(t.put(seqno, seqno.to_string()), "put {}", seqno);
        assert_eq!(t.get(seqno), Some(&seqno.to_string()));
    }

    #[test]
    fn test_creation() {
        let t = table(3, 10, 0);
        assert_eq!(t.size(), 0);
        assert!(t.get(15).is_none());
        assert_eq!(t.capacity(), 3 * 16);
    }

    #[test]
    fn test_addition_with_offset() {
        let mut t = table(3, 10, 100);
        for s in [100, 101, 105, 109, 110, 111, 119, 120, 129] {
            add_and_get(&mut t, s);
        }
        assert_eq!(t.size(), 9);
        assert!(!t.put(99, "x".into()));
    }

    #[test]
    fn test_duplicate_addition() {
        let mut t = table(3, 10, 0);
        for s in [0, 1, 5, 9, 10] {
            add_and_get(&mut t, s);
        }
        assert!(!t.put(5, "other".into()));
        assert_eq!(t.get(5), Some(&"5".to_string()));
        assert_eq!(t.size(), 5);
    }

    #[test]
    fn test_remove_and_null_count() {
        let mut t = table(3, 10, 1);
        for s in (1..=20).filter(|s| s % 2 == 0) {
            t.put(s, s.to_string());
        }
        assert_eq!(t.size(), 10);
        assert_eq!(t.null_count(1, 20), 10);
        for s in 1..=10 {
            t.remove(s);
        }
        assert_eq!(t.size(), 5);
        assert_eq!(t.null_count(1, 20), 15);
    }

    #[test]
    fn test_mass_addition_grows() {
        let mut t = table(3, 10, 0);
        for s in 0..10_005 {
            t.put(s, String::new());
        }
        assert_eq!(t.size(), 10_005);
        assert!(t.capacity() >= 10_005);
        assert_eq!(t.capacity(), t.num_rows() * 16);
    }

    #[test]
    fn test_purge_then_put_reuses_rows() {
        let mut t = table(3, 10, 0);
        for s in 0..50 {
            add_and_get(&mut t, s);
        }
        assert_eq!(t.highest(), Some(49));
        t.purge(43);
        assert_eq!(t.highest_purged(), 43);
        add_and_get(&mut t, 52);
        assert!(t.get(43).is_none());
        for s in 44..50 {
            assert_eq!(t.get(s), Some(&s.to_string()));
        }
        assert!(t.get(50).is_none());
        assert!(t.get(53).is_none());
        assert!(!t.put(40, "late".into()));
    }

    #[test]
    fn test_purge_everything() {
        let mut t = table(3, 10, 0);
        for s in 0..50 {
            t.put(s, s.to_string());
        }
        t.purge(49);
        assert!(t.is_empty());
        add_and_get(&mut t, 50);
        assert_eq!(t.size(), 1);
    }

    #[test]
    fn test_purge_keeps_later_messages() {
        let mut t = table(5, 10, 0);
        for s in 0..25 {
            t.put(s, String::new());
        }
        let extra = [30, 31, 32, 37, 38, 39, 40, 41, 42, 47, 48, 49];
        for s in extra {
            t.put(s, String::new());
        }
        for s in 0..=22 {
            t.remove(s);
        }
        t.purge(22);
        assert_eq!(t.size(), 2 + extra.len());
    }

    #[test]
    fn test_compact() {
        let mut t = table(3, 10, 0);
        for s in 0..80 {
            t.put(s, s.to_string());
        }
        t.purge(59);
        assert_eq!(t.size(), 20);
        t.compact();
        assert_eq!(t.size(), 20);
        assert_eq!(t.offset(), 48);
        for s in 60..80 {
            assert_eq!(t.get(s), Some(&s.to_string()));
        }
    }

    #[test]
    fn test_compact_with_automatic_purging() {
        let mut t = table(3, 10, 0).with_automatic_purging(true);
        for s in 0..80 {
            t.put(s, s.to_string());
        }
        for s in 0..=59 {
            t.remove(s);
        }
        assert_eq!(t.size(), 20);
        assert_eq!(t.highest_purged(), 59);
        t.compact();
        assert_eq!(t.size(), 20);
    }

    #[test]
    fn test_automatic_purging_removes_prefix() {
        let mut t = table(3, 10, 1).with_automatic_purging(true);
        for s in 1..=10 {
            t.put(s, String::new());
        }
        t.remove(7);
        assert_eq!(t.size(), 3);
        assert_eq!(t.highest_purged(), 7);
    }

    #[test]
    fn test_size_of_all_messages() {
        let mut t: RetransmitTable<Vec<u8>> = RetransmitTable::new(3, 10, 0, 1.2).unwrap();
        assert_eq!(t.size_of_all_messages(|m| m.len()), 0);
        t.put(2, vec![0; 100]);
        assert_eq!(t.size_of_all_messages(|m| m.len()), 100);
        for s in 5..10 {
            t.put(s, vec![0; 100]);
        }
        assert_eq!(t.size_of_all_messages(|m| m.len()), 600);
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(matches!(
            RetransmitTable::<u8>::new(0, 10, 0, 1.2),
            Err(WindowError::InvalidDimensions { .. })
        ));
        assert!(matches!(
            RetransmitTable::<u8>::new(3, 10, 0, 1.0),
            Err(WindowError::InvalidResizeFactor(_))
        ));
    }
}
