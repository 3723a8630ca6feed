//! Peer discovery boundary
//!
//! Discovery is an external collaborator. Membership asks it for the
//! members currently reachable in a cluster (to find a coordinator when
//! joining, and to detect split views when looking for merges) and keeps
//! its own entry current as views change.

use crate::address::Address;
use crate::view::View;

/// What one member advertises about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingData {
    pub address: Address,
    pub cluster: String,
    /// Installed view, `None` while joining
    pub view: Option<View>,
    pub is_coord: bool,
}

impl PingData {
    /// Entry for a member that has not joined yet.
    pub fn joining(address: Address, cluster: impl Into<String>) -> Self {
        Self {
            address,
            cluster: cluster.into(),
            view: None,
            is_coord: false,
        }
    }

    /// Entry for a member with `view` installed.
    pub fn member(address: Address, cluster: impl Into<String>, view: View) -> Self {
        let is_coord = view.coordinator() == Some(&address);
        Self {
            address,
            cluster: cluster.into(),
            view: Some(view),
            is_coord,
        }
    }

    /// Whether the member is part of a view (as opposed to still joining).
    pub fn is_server(&self) -> bool {
        self.view.is_some()
    }
}

/// Locates peers.
pub trait Discovery: Send + Sync {
    /// Entries of the members of `cluster` reachable from `requester`,
    /// excluding the requester itself.
    fn find_members(&self, requester: &Address, cluster: &str) -> Vec<PingData>;

    /// Advertise or refresh an entry.
    fn publish(&self, data: PingData);

    /// Stop advertising `member`.
    fn withdraw(&self, member: &Address);
}
