//! Merge arithmetic: cleaning up reported views, choosing who takes part,
//! and folding the collected views and digests into one.

use std::collections::{BTreeSet, HashMap};

use super::comparator::CoordinatorComparator;
use crate::address::Address;
use crate::view::{Digest, Membership, View, ViewId};

/// Drop asymmetric membership claims from the views reported by each
/// member: if `k` lists `m` but `m`'s own view does not list `k`, then `m`
/// is removed from `k`'s view. A reporter is never removed from its own
/// view. Runs until nothing changes, so applying it twice is a no-op.
pub fn sanitize_views(views: &mut HashMap<Address, View>) {
    loop {
        let mut changed = false;
        let snapshot: Vec<(Address, View)> =
            views.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        for (reporter, view) in snapshot {
            let keep: Vec<Address> = view
                .members()
                .iter()
                .filter(|m| {
                    *m == &reporter
                        || views.get(*m).map_or(true, |theirs| theirs.contains(&reporter))
                })
                .cloned()
                .collect();
            if keep.len() != view.size() {
                changed = true;
                views.insert(reporter, View::new(view.view_id().clone(), keep));
            }
        }
        if !changed {
            return;
        }
    }
}

/// Coordinators of the reported views, in address order.
pub fn determine_merge_coords(views: &HashMap<Address, View>) -> Vec<Address> {
    views
        .values()
        .filter_map(|v| v.coordinator().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// The coordinators plus every member that no coordinator's own view
/// accounts for.
pub fn determine_merge_participants(views: &HashMap<Address, View>) -> Vec<Address> {
    let coords = determine_merge_coords(views);
    let mut participants: BTreeSet<Address> = views
        .values()
        .flat_map(|v| v.members().iter().cloned())
        .collect();
    for coord in &coords {
        if let Some(view) = views.get(coord) {
            for m in view.members() {
                participants.remove(m);
            }
        }
    }
    participants.extend(coords);
    participants.into_iter().collect()
}

/// Fold the views and digests collected from the subgroup coordinators.
///
/// The merged view id is one past the highest reported id, created by the
/// first member in comparator order. Members without a digest entry are
/// left out, and the digest only keeps entries for the merged members.
pub fn consolidate(
    responses: &[(View, Digest)],
    comparator: &dyn CoordinatorComparator,
) -> Option<(View, Digest)> {
    if responses.is_empty() {
        return None;
    }
    let max_id = responses
        .iter()
        .map(|(v, _)| v.view_id().id())
        .max()
        .unwrap_or(0);

    let mut digest = Digest::new();
    for (_, d) in responses {
        digest.merge(d);
    }

    let mut members = Membership::new();
    for (view, _) in responses {
        members.add_all(view.members());
    }
    members.retain(|m| digest.contains(m));
    members.sort_by(|a, b| comparator.compare(a, b));

    let creator = members.first()?.clone();
    let members = members.into_members();
    digest.retain(&members);
    Some((View::new(ViewId::new(creator, max_id + 1), members), digest))
}
