//! Coordinator arbitration.
//!
//! When subgroups merge, the comparator decides which coordinator leads the
//! merge and in which order the merged members are listed.

use std::cmp::Ordering;

use crate::address::Address;

pub trait CoordinatorComparator: Send + Sync {
    fn compare(&self, a: &Address, b: &Address) -> Ordering;
}

/// Plain address order.
#[derive(Debug, Default, Clone, Copy)]
pub struct AddressOrder;

impl CoordinatorComparator for AddressOrder {
    fn compare(&self, a: &Address, b: &Address) -> Ordering {
        a.cmp(b)
    }
}

/// Sorts one configured address before every other, the rest by address.
#[derive(Debug, Clone)]
pub struct PreferredCoordinator {
    preferred: Address,
}

impl PreferredCoordinator {
    pub fn new(preferred: Address) -> Self {
        Self { preferred }
    }
}

impl CoordinatorComparator for PreferredCoordinator {
    fn compare(&self, a: &Address, b: &Address) -> Ordering {
        match (a == &self.preferred, b == &self.preferred) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => a.cmp(b),
        }
    }
}

pub fn comparator_for(preferred: Option<&Address>) -> Box<dyn CoordinatorComparator> {
    match preferred {
        Some(p) => Box::new(PreferredCoordinator::new(p.clone())),
        None => Box::new(AddressOrder),
    }
}

/// The smallest address according to `cmp`.
pub fn select_first<'a>(
    cmp: &dyn CoordinatorComparator,
    candidates: impl IntoIterator<Item = &'a Address>,
) -> Option<&'a Address> {
    candidates.into_iter().min_by(|a, b| cmp.compare(a, b))
}
