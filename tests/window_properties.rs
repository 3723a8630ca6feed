//! Window and merge property tests
//!
//! Tests for the ordering structures underneath the reliable protocols:
//! - Gap-aware in-order delivery
//! - Duplicate rejection
//! - Retransmission backoff
//! - Merge sanitization idempotence and digest monotonicity

use std::collections::HashMap;
use std::time::Duration;

use aerocast::address::Address;
use aerocast::gms::{consolidate, sanitize_views, AddressOrder};
use aerocast::view::{Digest, View, ViewId};
use aerocast::window::{AckReceiverWindow, Interval, NakReceiverWindow};

fn addr(n: u128) -> Address {
    Address::from_u128(n)
}

fn view(creator: u128, id: u64, members: &[u128]) -> View {
    View::new(
        ViewId::new(addr(creator), id),
        members.iter().map(|n| addr(*n)).collect(),
    )
}

// =============================================================================
// Receive windows
// =============================================================================

/// Stale seqnos are rejected, and removal stops at the first gap until it is
/// filled.
#[test]
fn test_ack_receiver_window_gap_scenario() {
    let mut win: AckReceiverWindow<&str> = AckReceiverWindow::new(10);

    assert!(!win.add(9, "nine"));
    assert!(win.add(10, "ten"));
    assert_eq!(win.size(), 1);
    assert!(win.add(13, "thirteen"));
    assert_eq!(win.size(), 2);

    assert_eq!(win.remove(), Some("ten"));
    assert_eq!(win.size(), 1);
    assert_eq!(win.remove(), None);
    assert_eq!(win.size(), 1);

    assert!(win.add(11, "eleven"));
    assert!(win.add(12, "twelve"));
    assert_eq!(win.size(), 3);

    assert_eq!(win.remove(), Some("eleven"));
    assert_eq!(win.remove(), Some("twelve"));
    assert_eq!(win.remove(), Some("thirteen"));
    assert_eq!(win.remove(), None);
}

/// For several missing subsets: everything below the first gap comes out in
/// order, nothing comes out until the gap is filled, then the rest comes out
/// exactly once and in order.
#[test]
fn test_gap_aware_delivery() {
    const N: u64 = 40;
    let missing_sets: [&[u64]; 4] = [&[1], &[7, 8, 9], &[5, 21, 40], &[2, 3, 17, 18, 33]];

    for missing in missing_sets {
        let mut win: NakReceiverWindow<u64> = NakReceiverWindow::new(0, 4, 8, 1.2).unwrap();
        // Arrival order: odd seqnos descending, then even ascending.
        let mut order: Vec<u64> = (1..=N).filter(|s| s % 2 == 1).rev().collect();
        order.extend((1..=N).filter(|s| s % 2 == 0));

        for seqno in order.iter().copied().filter(|s| !missing.contains(s)) {
            assert!(win.add(seqno, seqno).is_added());
        }

        let first_gap = *missing.iter().min().unwrap();
        let head = win.remove_many(usize::MAX);
        assert_eq!(head, (1..first_gap).collect::<Vec<_>>());
        assert_eq!(win.remove(), None);

        for seqno in missing {
            assert!(win.add(*seqno, *seqno).is_added());
        }
        let rest = win.remove_many(usize::MAX);
        assert_eq!(rest, (first_gap..=N).collect::<Vec<_>>());
        assert_eq!(win.remove(), None);
        assert_eq!(win.highest_delivered(), N);
    }
}

/// Adding a seqno twice is refused and does not grow the window, whether
/// the first copy was delivered or is still buffered.
#[test]
fn test_duplicates_never_grow_the_window() {
    let mut win: NakReceiverWindow<&str> = NakReceiverWindow::new(0, 4, 4, 1.5).unwrap();
    assert!(win.add(1, "a").is_added());
    assert!(win.add(3, "c").is_added());
    let size = win.size();

    assert!(!win.add(3, "c").is_added());
    assert_eq!(win.size(), size);

    assert_eq!(win.remove(), Some("a"));
    assert!(!win.add(1, "a").is_added());
    assert_eq!(win.size(), size);
}

// =============================================================================
// Retransmission intervals
// =============================================================================

#[test]
fn test_exponential_interval_scenario() {
    let mut interval =
        Interval::exponential(Duration::from_millis(1000), Duration::from_millis(15_000)).unwrap();
    let delays: Vec<u64> = (0..6).map(|_| interval.next().as_millis() as u64).collect();
    assert_eq!(delays, vec![1000, 2000, 4000, 8000, 15_000, 15_000]);

    // Each range gets its own copy starting over.
    let mut fresh = interval.fresh();
    assert_eq!(fresh.next(), Duration::from_millis(1000));
}

// =============================================================================
// Merge arithmetic
// =============================================================================

/// Sanitizing an already sanitized map changes nothing.
#[test]
fn test_sanitize_is_idempotent() {
    let reports: Vec<HashMap<Address, View>> = vec![
        // Two clean subgroups
        HashMap::from([
            (addr(1), view(1, 4, &[1, 2])),
            (addr(2), view(1, 4, &[1, 2])),
            (addr(3), view(3, 2, &[3, 4])),
            (addr(4), view(3, 2, &[3, 4])),
        ]),
        // 1 still lists 3, 3 has moved on
        HashMap::from([
            (addr(1), view(1, 5, &[1, 2, 3])),
            (addr(2), view(1, 5, &[1, 2, 3])),
            (addr(3), view(3, 2, &[3, 4])),
            (addr(4), view(3, 2, &[3, 4])),
        ]),
        // Everyone claims everyone, except 5 which only sees itself
        HashMap::from([
            (addr(1), view(1, 7, &[1, 2, 5])),
            (addr(2), view(1, 7, &[1, 2, 5])),
            (addr(5), view(5, 1, &[5])),
        ]),
    ];

    for mut views in reports {
        sanitize_views(&mut views);
        let once = views.clone();
        sanitize_views(&mut views);
        assert_eq!(views, once);
        for (reporter, v) in &once {
            assert!(v.contains(reporter));
            for m in v.members() {
                assert!(once.get(m).map_or(true, |theirs| theirs.contains(reporter)));
            }
        }
    }
}

/// The merged digest never shows less progress than any subgroup reported.
#[test]
fn test_merged_digest_is_monotonic() {
    let left = (
        view(1, 6, &[1, 2]),
        Digest::new()
            .with(addr(1), 0, 10, 12)
            .with(addr(2), 0, 4, 4),
    );
    let right = (
        view(3, 3, &[3, 4]),
        Digest::new()
            .with(addr(3), 0, 7, 7)
            .with(addr(4), 0, 2, 3)
            .with(addr(1), 0, 8, 8),
    );

    let (merged, digest) = consolidate(&[left.clone(), right.clone()], &AddressOrder).unwrap();
    assert_eq!(merged.view_id().id(), 7);
    assert_eq!(merged.members(), &[addr(1), addr(2), addr(3), addr(4)]);

    for (_, reported) in [&left, &right] {
        for (sender, entry) in reported.iter() {
            let out = digest.get(sender).unwrap();
            assert!(out.highest_delivered >= entry.highest_delivered);
            assert!(out.highest_received >= entry.highest_received);
        }
    }
    assert!(digest.is_greater_or_equal(&left.1));
    assert!(digest.is_greater_or_equal(&right.1));
}
