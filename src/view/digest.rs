//! Digests
//!
//! A digest summarizes reliable-delivery progress per sender:
//! - `low`: lowest seqno still retained (everything below was purged as stable)
//! - `highest_delivered`: highest seqno delivered in order
//! - `highest_received`: highest seqno seen, possibly with gaps below it
//!
//! Invariant: `highest_delivered <= highest_received` for every entry.
//! Merging takes the minimum `low` and the maximum of the other two, so the
//! merged digest always represents at least as much knowledge as either input.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::address::Address;

/// Progress for one sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DigestEntry {
    pub low: u64,
    pub highest_delivered: u64,
    pub highest_received: u64,
}

impl DigestEntry {
    /// Create an entry, raising `highest_received` to `highest_delivered` if needed.
    pub fn new(low: u64, highest_delivered: u64, highest_received: u64) -> Self {
        Self {
            low,
            highest_delivered,
            highest_received: highest_received.max(highest_delivered),
        }
    }

    /// Highest seqno known for the sender, delivered or not.
    pub fn highest(&self) -> u64 {
        self.highest_delivered.max(self.highest_received)
    }

    /// Componentwise merge: more knowledge wins.
    pub fn merge(&self, other: &DigestEntry) -> DigestEntry {
        DigestEntry::new(
            self.low.min(other.low),
            self.highest_delivered.max(other.highest_delivered),
            self.highest_received.max(other.highest_received),
        )
    }
}

/// Per-sender delivery progress, ordered by address.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Digest {
    entries: BTreeMap<Address, DigestEntry>,
}

impl Digest {
    /// Create an empty digest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the entry for a sender, replacing any previous value.
    pub fn insert(&mut self, sender: Address, entry: DigestEntry) {
        let entry = DigestEntry::new(entry.low, entry.highest_delivered, entry.highest_received);
        self.entries.insert(sender, entry);
    }

    /// Builder-style insert.
    pub fn with(mut self, sender: Address, low: u64, delivered: u64, received: u64) -> Self {
        self.insert(sender, DigestEntry::new(low, delivered, received));
        self
    }

    /// Entry for a sender.
    pub fn get(&self, sender: &Address) -> Option<&DigestEntry> {
        self.entries.get(sender)
    }

    /// Whether the digest has an entry for `sender`.
    pub fn contains(&self, sender: &Address) -> bool {
        self.entries.contains_key(sender)
    }

    /// Senders in address order.
    pub fn members(&self) -> impl Iterator<Item = &Address> {
        self.entries.keys()
    }

    /// Entries in address order.
    pub fn iter(&self) -> impl Iterator<Item = (&Address, &DigestEntry)> {
        self.entries.iter()
    }

    /// Number of senders.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge another digest into this one.
    ///
    /// Senders only in `other` are added; shared senders are merged
    /// componentwise.
    pub fn merge(&mut self, other: &Digest) {
        for (sender, theirs) in &other.entries {
            let merged = match self.entries.get(sender) {
                Some(mine) => mine.merge(theirs),
                None => *theirs,
            };
            self.entries.insert(sender.clone(), merged);
        }
    }

    /// Keep only entries for the given members.
    pub fn retain(&mut self, members: &[Address]) {
        self.entries.retain(|k, _| members.contains(k));
    }

    /// True when, for every sender present in both digests, this digest has
    /// seen at least as much as `other`.
    pub fn is_greater_or_equal(&self, other: &Digest) -> bool {
        other.entries.iter().all(|(sender, theirs)| match self.entries.get(sender) {
            Some(mine) => mine.highest() >= theirs.highest(),
            None => true,
        })
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (sender, e)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(
                f,
                "{}: [{} : {} ({})]",
                sender, e.low, e.highest_delivered, e.highest_received
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u128) -> Address {
        Address::from_u128(n)
    }

    #[test]
    fn test_entry_invariant() {
        let e = DigestEntry::new(0, 10, 4);
        assert_eq!(e.highest_received, 10);
        assert!(e.highest_delivered <= e.highest_received);
    }

    #[test]
    fn test_merge_more_knowledge_wins() {
        let mut d1 = Digest::new().with(addr(1), 5, 10, 12).with(addr(2), 0, 3, 3);
        let d2 = Digest::new().with(addr(1), 2, 8, 20).with(addr(3), 0, 7, 9);
        d1.merge(&d2);

        assert_eq!(d1.get(&addr(1)), Some(&DigestEntry::new(2, 10, 20)));
        assert_eq!(d1.get(&addr(2)), Some(&DigestEntry::new(0, 3, 3)));
        assert_eq!(d1.get(&addr(3)), Some(&DigestEntry::new(0, 7, 9)));
    }

    #[test]
    fn test_merge_is_commutative_on_shared_senders() {
        let a = Digest::new().with(addr(1), 1, 4, 6);
        let b = Digest::new().with(addr(1), 0, 5, 5);
        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_greater_or_equal() {
        let mine = Digest::new().with(addr(1), 0, 10, 10).with(addr(2), 0, 5, 5);
        let theirs = Digest::new().with(addr(1), 0, 8, 9).with(addr(3), 0, 100, 100);
        assert!(mine.is_greater_or_equal(&theirs));

        let ahead = Digest::new().with(addr(2), 0, 5, 6);
        assert!(!mine.is_greater_or_equal(&ahead));
    }

    #[test]
    fn test_retain() {
        let mut d = Digest::new().with(addr(1), 0, 1, 1).with(addr(2), 0, 1, 1);
        d.retain(&[addr(2)]);
        assert_eq!(d.len(), 1);
        assert!(d.contains(&addr(2)));
    }
}
