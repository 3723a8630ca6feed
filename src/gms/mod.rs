//! Group membership (GMS)
//!
//! Keeps every member's view of the group consistent:
//! - joiners find a coordinator through discovery and are admitted with
//!   the coordinator's digest, so they start delivering where it stands
//! - the coordinator turns batches of joins, leaves and suspicions into a
//!   single new view, multicasts it and waits for acknowledgements
//! - when the coordinator is suspected, the next unsuspected member in the
//!   view takes over
//! - subgroups left behind by a partition are merged: the leading
//!   coordinator collects every subgroup's view and digest, installs the
//!   consolidated view everywhere, and members rebroadcast to catch up
//!
//! Who leads a merge and how the merged members are ordered is decided by
//! a `CoordinatorComparator`; how a view changes on joins and departures
//! by a `MembershipChangePolicy`.

mod comparator;
mod merge;
mod policy;
mod protocol;

pub use comparator::{
    comparator_for, select_first, AddressOrder, CoordinatorComparator, PreferredCoordinator,
};
pub use merge::{consolidate, determine_merge_coords, determine_merge_participants, sanitize_views};
pub use policy::{
    policy_for, DefaultMembershipPolicy, MembershipChangePolicy, PromoteNewestPolicy,
};
pub use protocol::{Gms, GmsState};
