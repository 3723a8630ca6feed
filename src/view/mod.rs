//! Membership views and delivery digests
//!
//! - `ViewId`: (creator, logical clock), ordered by clock then creator
//! - `View`: ordered unique members, coordinator first
//! - `Digest`: per-sender (low, highest delivered, highest received)
//! - `Membership`: scratch list used while computing new views

mod digest;
mod membership;
mod view;
mod view_id;

pub use digest::{Digest, DigestEntry};
pub use membership::Membership;
pub use view::View;
pub use view_id::ViewId;
