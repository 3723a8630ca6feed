//! Member addresses
//!
//! An address is the identity of one logical cluster member:
//! - Created when a channel connects, immutable afterwards
//! - Totally ordered and hashable, used as a map key everywhere
//! - Optionally scoped to a site for multi-site deployments
//!
//! Ordering compares the UUID first and the site tag second, so a base
//! address and its site-scoped variants sort next to each other.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    uuid: Uuid,
    site: Option<Arc<str>>,
}

impl Address {
    /// Create a fresh random address.
    pub fn random() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            site: None,
        }
    }

    /// Create an address from an explicit UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self { uuid, site: None }
    }

    /// Create an address from a 128-bit value.
    ///
    /// Small values give predictable ordering, which is what tests use to
    /// force a particular coordinator.
    pub fn from_u128(value: u128) -> Self {
        Self::from_uuid(Uuid::from_u128(value))
    }

    /// Compose this address with a site tag.
    pub fn with_site(&self, site: impl AsRef<str>) -> Self {
        Self {
            uuid: self.uuid,
            site: Some(Arc::from(site.as_ref())),
        }
    }

    /// The base address without a site tag.
    pub fn base(&self) -> Self {
        Self::from_uuid(self.uuid)
    }

    /// Underlying UUID.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Site tag, if this is a site-scoped address.
    pub fn site(&self) -> Option<&str> {
        self.site.as_deref()
    }

    /// Whether this address carries a site tag.
    pub fn is_site_scoped(&self) -> bool {
        self.site.is_some()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.uuid.simple().to_string();
        let short = &simple[simple.len() - 8..];
        match &self.site {
            Some(site) => write!(f, "{}:{}", short, site),
            None => write!(f, "{}", short),
        }
    }
}
