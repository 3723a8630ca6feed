//! Mutable membership list used while computing new views.

use std::cmp::Ordering;

use crate::address::Address;

/// Ordered, duplicate-free list of members.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
    members: Vec<Address>,
}

impl Membership {
    /// Create an empty membership.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from an initial list, dropping duplicates.
    pub fn from_members<'a>(members: impl IntoIterator<Item = &'a Address>) -> Self {
        let mut m = Self::new();
        m.add_all(members);
        m
    }

    /// Append a member unless already present.
    pub fn add(&mut self, member: &Address) {
        if !self.members.contains(member) {
            self.members.push(member.clone());
        }
    }

    /// Append every member not yet present, preserving order.
    pub fn add_all<'a>(&mut self, members: impl IntoIterator<Item = &'a Address>) {
        for m in members {
            self.add(m);
        }
    }

    /// Remove a member.
    pub fn remove(&mut self, member: &Address) {
        self.members.retain(|m| m != member);
    }

    /// Remove every listed member.
    pub fn remove_all<'a>(&mut self, members: impl IntoIterator<Item = &'a Address>) {
        for m in members {
            self.remove(m);
        }
    }

    /// Keep only members accepted by the predicate.
    pub fn retain(&mut self, mut keep: impl FnMut(&Address) -> bool) {
        self.members.retain(|m| keep(m));
    }

    /// Sort with the given comparator.
    pub fn sort_by(&mut self, cmp: impl FnMut(&Address, &Address) -> Ordering) {
        self.members.sort_by(cmp);
    }

    /// Whether `member` is present.
    pub fn contains(&self, member: &Address) -> bool {
        self.members.contains(member)
    }

    /// First member, if any.
    pub fn first(&self) -> Option<&Address> {
        self.members.first()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether empty.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members in order.
    pub fn members(&self) -> &[Address] {
        &self.members
    }

    /// Consume into the member list.
    pub fn into_members(self) -> Vec<Address> {
        self.members
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_remove() {
        let a = Address::from_u128(1);
        let b = Address::from_u128(2);
        let mut m = Membership::new();
        m.add(&b);
        m.add(&a);
        m.add(&b);
        assert_eq!(m.members(), &[b.clone(), a.clone()]);

        m.remove(&b);
        assert_eq!(m.members(), &[a]);
    }

    #[test]
    fn test_sort() {
        let mut m = Membership::from_members(&[Address::from_u128(3), Address::from_u128(1)]);
        m.sort_by(|a, b| a.cmp(b));
        assert_eq!(m.first(), Some(&Address::from_u128(1)));
    }
}
