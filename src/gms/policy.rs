//! Membership change policies
//!
//! A policy turns the current member list plus the pending joins, leaves
//! and suspicions into the member list of the next view. The coordinator is
//! always the first member of the result.

use crate::address::Address;
use crate::stack::PolicyKind;
use crate::view::Membership;

/// Computes the members of the next view.
pub trait MembershipChangePolicy: Send + Sync {
    fn new_membership(
        &self,
        current: &[Address],
        joiners: &[Address],
        leavers: &[Address],
        suspects: &[Address],
    ) -> Vec<Address>;
}

/// Keeps the existing order, drops leavers and suspects, appends joiners.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultMembershipPolicy;

impl MembershipChangePolicy for DefaultMembershipPolicy {
    fn new_membership(
        &self,
        current: &[Address],
        joiners: &[Address],
        leavers: &[Address],
        suspects: &[Address],
    ) -> Vec<Address> {
        let mut members = Membership::from_members(current);
        members.remove_all(leavers);
        members.remove_all(suspects);
        members.add_all(joiners);
        members.into_members()
    }
}

/// Like the default policy, but when the coordinator goes away the most
/// recently added member takes over instead of the next oldest one.
#[derive(Debug, Default, Clone, Copy)]
pub struct PromoteNewestPolicy;

impl MembershipChangePolicy for PromoteNewestPolicy {
    fn new_membership(
        &self,
        current: &[Address],
        joiners: &[Address],
        leavers: &[Address],
        suspects: &[Address],
    ) -> Vec<Address> {
        let mut members =
            DefaultMembershipPolicy.new_membership(current, joiners, leavers, suspects);
        let coord_gone = current
            .first()
            .is_some_and(|c| leavers.contains(c) || suspects.contains(c));
        if coord_gone && members.len() > 1 {
            if let Some(newest) = members.pop() {
                members.insert(0, newest);
            }
        }
        members
    }
}

pub fn policy_for(kind: PolicyKind) -> Box<dyn MembershipChangePolicy> {
    match kind {
        PolicyKind::Default => Box::new(DefaultMembershipPolicy),
        PolicyKind::PromoteNewest => Box::new(PromoteNewestPolicy),
    }
}
