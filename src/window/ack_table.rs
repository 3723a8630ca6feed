//! Cumulative acknowledgment table.
//!
//! For one sender, records the highest seqno each current member has
//! acknowledged (delivered). The minimum over all members is the stable
//! point: nobody will ever ask for those messages again.

use std::collections::BTreeMap;

use crate::address::Address;

/// Highest acknowledged seqno per member.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckTable {
    acks: BTreeMap<Address, u64>,
}

impl AckTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `member` acknowledged everything up to `seqno`.
    /// Acks never move backwards. Returns whether the entry advanced.
    pub fn ack(&mut self, member: &Address, seqno: u64) -> bool {
        let entry = self.acks.entry(member.clone()).or_insert(0);
        if seqno > *entry {
            *entry = seqno;
            true
        } else {
            false
        }
    }

    /// Drop members not in `members` and add new members at zero.
    pub fn adjust(&mut self, members: &[Address]) {
        self.acks.retain(|m, _| members.contains(m));
        for m in members {
            self.acks.entry(m.clone()).or_insert(0);
        }
    }

    /// Lowest acknowledged seqno across members, `None` when empty.
    pub fn min(&self) -> Option<u64> {
        self.acks.values().copied().min()
    }

    pub fn get(&self, member: &Address) -> Option<u64> {
        self.acks.get(member).copied()
    }

    pub fn len(&self) -> usize {
        self.acks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acks.is_empty()
    }
}
