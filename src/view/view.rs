//! Views
//!
//! A view is the agreed membership of the group at one point in time:
//! - Members are ordered and unique
//! - The first member is the coordinator
//! - Exactly one view is current per member; the next view supersedes it

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::view_id::ViewId;
use crate::address::Address;

/// An ordered, duplicate-free membership list with its identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    view_id: ViewId,
    members: Vec<Address>,
}

impl View {
    /// Create a view. Duplicate members are dropped, keeping the first occurrence.
    pub fn new(view_id: ViewId, members: Vec<Address>) -> Self {
        let mut seen = HashSet::with_capacity(members.len());
        let members = members
            .into_iter()
            .filter(|m| seen.insert(m.clone()))
            .collect();
        Self { view_id, members }
    }

    /// A view containing only `member`, created by that member.
    pub fn singleton(member: Address) -> Self {
        Self::new(ViewId::new(member.clone(), 1), vec![member])
    }

    /// The view identifier.
    pub fn view_id(&self) -> &ViewId {
        &self.view_id
    }

    /// Members in view order.
    pub fn members(&self) -> &[Address] {
        &self.members
    }

    /// The coordinator (first member).
    pub fn coordinator(&self) -> Option<&Address> {
        self.members.first()
    }

    /// Whether `member` is part of this view.
    pub fn contains(&self, member: &Address) -> bool {
        self.members.contains(member)
    }

    /// Number of members.
    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Whether the view has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Position of a member in view order.
    pub fn rank(&self, member: &Address) -> Option<usize> {
        self.members.iter().position(|m| m == member)
    }

    /// Members in `new` that are not in `old`, and members of `old` missing from `new`.
    pub fn diff(old: Option<&View>, new: &View) -> (Vec<Address>, Vec<Address>) {
        let Some(old) = old else {
            return (new.members.clone(), Vec::new());
        };
        let joined = new
            .members
            .iter()
            .filter(|m| !old.contains(m))
            .cloned()
            .collect();
        let left = old
            .members
            .iter()
            .filter(|m| !new.contains(m))
            .cloned()
            .collect();
        (joined, left)
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (", self.view_id)?;
        for (i, m) in self.members.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", m)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u128) -> Address {
        Address::from_u128(n)
    }

    #[test]
    fn test_coordinator_is_first() {
        let view = View::new(ViewId::new(addr(2), 1), vec![addr(2), addr(1), addr(3)]);
        assert_eq!(view.coordinator(), Some(&addr(2)));
        assert_eq!(view.size(), 3);
        assert_eq!(view.rank(&addr(3)), Some(2));
    }

    #[test]
    fn test_duplicates_removed() {
        let view = View::new(
            ViewId::new(addr(1), 1),
            vec![addr(1), addr(2), addr(1), addr(2)],
        );
        assert_eq!(view.members(), &[addr(1), addr(2)]);
    }

    #[test]
    fn test_diff() {
        let old = View::new(ViewId::new(addr(1), 1), vec![addr(1), addr(2), addr(3)]);
        let new = View::new(ViewId::new(addr(1), 2), vec![addr(1), addr(3), addr(4)]);
        let (joined, left) = View::diff(Some(&old), &new);
        assert_eq!(joined, vec![addr(4)]);
        assert_eq!(left, vec![addr(2)]);

        let (joined, left) = View::diff(None, &new);
        assert_eq!(joined.len(), 3);
        assert!(left.is_empty());
    }

    #[test]
    fn test_singleton() {
        let view = View::singleton(addr(5));
        assert_eq!(view.coordinator(), Some(&addr(5)));
        assert_eq!(view.view_id().id(), 1);
    }
}
