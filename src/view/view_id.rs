//! View identifiers

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::address::Address;

/// Identifier of a view: the creating coordinator plus a logical clock.
///
/// Ordering compares `id` first and breaks ties with the creator, so two
/// coordinators that happen to pick the same id still produce a total order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewId {
    creator: Address,
    id: u64,
}

impl ViewId {
    /// Create a view id.
    pub fn new(creator: Address, id: u64) -> Self {
        Self { creator, id }
    }

    /// The member that created the view.
    pub fn creator(&self) -> &Address {
        &self.creator
    }

    /// The logical clock value.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The id the next view created by `creator` should carry.
    pub fn successor(&self, creator: Address) -> ViewId {
        ViewId::new(creator, self.id + 1)
    }
}

impl Ord for ViewId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id
            .cmp(&other.id)
            .then_with(|| self.creator.cmp(&other.creator))
    }
}

impl PartialOrd for ViewId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}|{}]", self.creator, self.id)
    }
}
