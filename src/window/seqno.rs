//! Sequence numbers, ranges and arrival bitmaps
//!
//! - `Range`: inclusive `[low, high]`
//! - `Seqno`: ordered key that is either a single seqno, a range, or a
//!   lookup-only "dummy". A dummy compares equal to any range containing it,
//!   so an ordered map of disjoint ranges can be searched by a single seqno.
//! - `SeqnoRange`: a range plus a bitmap of which seqnos have arrived

use std::cmp::Ordering;
use std::fmt;

use super::errors::{WindowError, WindowResult};

/// Inclusive range of seqnos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Range {
    pub low: u64,
    pub high: u64,
}

impl Range {
    pub fn new(low: u64, high: u64) -> Self {
        debug_assert!(low <= high, "inverted range [{}, {}]", low, high);
        Self { low, high }
    }

    pub fn contains(&self, seqno: u64) -> bool {
        self.low <= seqno && seqno <= self.high
    }

    /// Number of seqnos covered.
    pub fn count(&self) -> u64 {
        self.high - self.low + 1
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.low == self.high {
            write!(f, "{}", self.low)
        } else {
            write!(f, "{}-{}", self.low, self.high)
        }
    }
}

/// Ordered map key for disjoint seqno ranges.
#[derive(Debug, Clone, Copy)]
pub struct Seqno {
    low: u64,
    high: u64,
    dummy: bool,
}

impl Seqno {
    /// Key for a single seqno.
    pub fn single(seqno: u64) -> Self {
        Self {
            low: seqno,
            high: seqno,
            dummy: false,
        }
    }

    /// Key for a range.
    pub fn range(low: u64, high: u64) -> Self {
        Self {
            low,
            high,
            dummy: false,
        }
    }

    /// Lookup key: equal to any stored range containing `seqno`.
    pub fn dummy(seqno: u64) -> Self {
        Self {
            low: seqno,
            high: seqno,
            dummy: true,
        }
    }

    pub fn low(&self) -> u64 {
        self.low
    }

    pub fn high(&self) -> u64 {
        self.high
    }

    pub fn is_dummy(&self) -> bool {
        self.dummy
    }
}

impl Ord for Seqno {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.dummy && other.low <= self.low && self.low <= other.high {
            return Ordering::Equal;
        }
        if other.dummy && self.low <= other.low && other.low <= self.high {
            return Ordering::Equal;
        }
        self.low.cmp(&other.low)
    }
}

impl PartialOrd for Seqno {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Seqno {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Seqno {}

/// A seqno range with a bitmap recording which seqnos arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeqnoRange {
    low: u64,
    high: u64,
    bits: Vec<u64>,
    received: u64,
}

impl SeqnoRange {
    pub fn new(low: u64, high: u64) -> WindowResult<Self> {
        if low > high {
            return Err(WindowError::InvalidRange { low, high });
        }
        let len = (high - low + 1) as usize;
        Ok(Self {
            low,
            high,
            bits: vec![0; len.div_ceil(64)],
            received: 0,
        })
    }

    pub fn low(&self) -> u64 {
        self.low
    }

    pub fn high(&self) -> u64 {
        self.high
    }

    /// Number of seqnos covered.
    pub fn size(&self) -> u64 {
        self.high - self.low + 1
    }

    pub fn contains(&self, seqno: u64) -> bool {
        self.low <= seqno && seqno <= self.high
    }

    fn slot(&self, seqno: u64) -> Option<(usize, u64)> {
        if !self.contains(seqno) {
            return None;
        }
        let offset = (seqno - self.low) as usize;
        Some((offset / 64, 1u64 << (offset % 64)))
    }

    /// Mark `seqno` as received. Returns true if it was not set before.
    pub fn set(&mut self, seqno: u64) -> bool {
        match self.slot(seqno) {
            Some((word, mask)) if self.bits[word] & mask == 0 => {
                self.bits[word] |= mask;
                self.received += 1;
                true
            }
            _ => false,
        }
    }

    /// Mark `seqno` as missing again. Returns true if it was set before.
    pub fn clear(&mut self, seqno: u64) -> bool {
        match self.slot(seqno) {
            Some((word, mask)) if self.bits[word] & mask != 0 => {
                self.bits[word] &= !mask;
                self.received -= 1;
                true
            }
            _ => false,
        }
    }

    /// Whether `seqno` has been received. Out-of-range seqnos are never received.
    pub fn get(&self, seqno: u64) -> bool {
        match self.slot(seqno) {
            Some((word, mask)) => self.bits[word] & mask != 0,
            None => false,
        }
    }

    pub fn received_count(&self) -> u64 {
        self.received
    }

    pub fn missing_count(&self) -> u64 {
        self.size() - self.received
    }

    /// Contiguous runs of seqnos not yet received.
    pub fn missing_ranges(&self) -> Vec<Range> {
        let mut ranges = Vec::new();
        let mut start: Option<u64> = None;
        for seqno in self.low..=self.high {
            match (self.get(seqno), start) {
                (false, None) => start = Some(seqno),
                (true, Some(s)) => {
                    ranges.push(Range::new(s, seqno - 1));
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = start {
            ranges.push(Range::new(s, self.high));
        }
        ranges
    }
}

impl fmt::Display for SeqnoRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{} ({} missing)",
            self.low,
            self.high,
            self.missing_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_set_clear_get() {
        let mut r = SeqnoRange::new(10, 15).unwrap();
        assert_eq!(r.size(), 6);
        assert!(r.set(10));
        assert!(!r.set(10));
        assert!(r.set(15));
        assert!(!r.set(16));
        assert!(r.get(10));
        assert!(!r.get(11));
        assert_eq!(r.received_count(), 2);
        assert_eq!(r.missing_count(), 4);

        assert!(r.clear(10));
        assert!(!r.clear(10));
        assert!(!r.get(10));
        assert_eq!(r.received_count(), 1);
    }

    #[test]
    fn test_missing_ranges() {
        let mut r = SeqnoRange::new(1, 10).unwrap();
        for s in [1, 2, 5, 9] {
            r.set(s);
        }
        assert_eq!(
            r.missing_ranges(),
            vec![Range::new(3, 4), Range::new(6, 8), Range::new(10, 10)]
        );

        for s in 1..=10 {
            r.set(s);
        }
        assert!(r.missing_ranges().is_empty());
    }

    #[test]
    fn test_large_range_spans_words() {
        let mut r = SeqnoRange::new(1000, 1200).unwrap();
        r.set(1130);
        assert!(r.get(1130));
        assert_eq!(r.missing_count(), 200);
    }

    #[test]
    fn test_invalid_range() {
        assert_eq!(
            SeqnoRange::new(5, 4).unwrap_err(),
            WindowError::InvalidRange { low: 5, high: 4 }
        );
    }

    #[test]
    fn test_dummy_finds_containing_range() {
        let mut map = BTreeMap::new();
        map.insert(Seqno::range(1, 5), "a");
        map.insert(Seqno::single(7), "b");
        map.insert(Seqno::range(10, 20), "c");

        assert_eq!(map.get(&Seqno::dummy(3)), Some(&"a"));
        assert_eq!(map.get(&Seqno::dummy(7)), Some(&"b"));
        assert_eq!(map.get(&Seqno::dummy(20)), Some(&"c"));
        assert_eq!(map.get(&Seqno::dummy(6)), None);
        assert_eq!(map.get(&Seqno::dummy(21)), None);
    }

    #[test]
    fn test_range_display() {
        assert_eq!(Range::new(3, 3).to_string(), "3");
        assert_eq!(Range::new(3, 9).to_string(), "3-9");
    }
}
