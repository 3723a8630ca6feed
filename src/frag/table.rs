//! Reassembly of fragmented messages.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use crate::address::Address;
use crate::message::{FragHeader, Message, ProtocolId};
use crate::sync::lock;
use crate::view::View;

struct Partial {
    pieces: Vec<Option<Bytes>>,
    received: u32,
    /// First fragment seen; supplies everything but the payload
    template: Message,
    started: Instant,
}

/// Fragments buffered per (sender, fragment id) until the set is complete.
pub struct FragmentTable {
    timeout: Duration,
    max_fragments: u32,
    partials: Mutex<HashMap<(Address, u64), Partial>>,
}

impl FragmentTable {
    /// Sets claiming more than `max_fragments` pieces are refused.
    pub fn new(timeout: Duration, max_fragments: u32) -> Self {
        Self {
            timeout,
            max_fragments,
            partials: Mutex::new(HashMap::new()),
        }
    }

    /// Add one fragment of `sender`. Returns the original message once the
    /// last missing fragment arrives; duplicates are ignored.
    pub fn add(
        &self,
        sender: &Address,
        header: FragHeader,
        mut fragment: Message,
        now: Instant,
    ) -> Option<Message> {
        if header.count == 0 || header.count > self.max_fragments || header.index >= header.count {
            return None;
        }
        let key = (sender.clone(), header.frag_id);
        let mut partials = lock(&self.partials);
        let partial = partials.entry(key.clone()).or_insert_with(|| Partial {
            pieces: vec![None; header.count as usize],
            received: 0,
            template: fragment.copy(true),
            started: now,
        });
        // A sender never reuses an id with a different count.
        if partial.pieces.len() != header.count as usize {
            return None;
        }
        let slot = &mut partial.pieces[header.index as usize];
        if slot.is_some() {
            return None;
        }
        *slot = Some(fragment.payload().clone());
        partial.received += 1;
        if partial.received < header.count {
            return None;
        }

        let partial = partials.remove(&key)?;
        drop(partials);
        let total: usize = partial.pieces.iter().flatten().map(|p| p.len()).sum();
        let mut payload = BytesMut::with_capacity(total);
        for piece in partial.pieces.iter().flatten() {
            payload.extend_from_slice(piece);
        }
        fragment = partial.template;
        fragment.remove_header(ProtocolId::FRAG);
        fragment.set_payload(payload.freeze());
        Some(fragment)
    }

    /// Drop incomplete sets older than the timeout. Returns how many.
    pub fn expire(&self, now: Instant) -> usize {
        let timeout = self.timeout;
        let mut partials = lock(&self.partials);
        let before = partials.len();
        partials.retain(|_, p| now.saturating_duration_since(p.started) < timeout);
        before - partials.len()
    }

    /// Drop incomplete sets of senders that are not in `view`.
    pub fn retain_members(&self, view: &View) -> usize {
        let mut partials = lock(&self.partials);
        let before = partials.len();
        partials.retain(|(sender, _), _| view.contains(sender));
        before - partials.len()
    }

    /// Incomplete sets being buffered.
    pub fn len(&self) -> usize {
        lock(&self.partials).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.partials).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Header;
    use crate::view::ViewId;

    fn addr(n: u128) -> Address {
        Address::from_u128(n)
    }

    fn fragment(frag_id: u64, index: u32, count: u32, data: &'static [u8]) -> (FragHeader, Message) {
        let h = FragHeader {
            frag_id,
            index,
            count,
        };
        let mut m = Message::new(None, data);
        m.put_header(ProtocolId::FRAG, Header::Frag(h));
        (h, m)
    }

    #[test]
    fn test_reassembles_out_of_order_exactly_once() {
        let table = FragmentTable::new(Duration::from_secs(1), 64);
        let now = Instant::now();
        let (h2, m2) = fragment(7, 2, 3, b"ghi");
        let (h0, m0) = fragment(7, 0, 3, b"abc");
        let (h1, m1) = fragment(7, 1, 3, b"def");
        assert!(table.add(&addr(1), h2, m2.clone(), now).is_none());
        assert!(table.add(&addr(1), h0, m0, now).is_none());
        assert!(table.add(&addr(1), h2, m2, now).is_none());
        assert_eq!(table.len(), 1);

        let whole = table.add(&addr(1), h1, m1.clone(), now).unwrap();
        assert_eq!(&whole.payload()[..], b"abcdefghi");
        assert!(whole.header(ProtocolId::FRAG).is_none());
        assert!(table.is_empty());
        // A late duplicate starts a new set instead of a second delivery.
        assert!(table.add(&addr(1), h1, m1, now).is_none());
    }

    #[test]
    fn test_oversized_set_refused_without_buffering() {
        let table = FragmentTable::new(Duration::from_secs(1), 64);
        let (h, m) = fragment(3, 0, 65, b"a");
        assert!(table.add(&addr(1), h, m, Instant::now()).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_sets_are_per_sender() {
        let table = FragmentTable::new(Duration::from_secs(1), 64);
        let now = Instant::now();
        let (h0, m0) = fragment(1, 0, 2, b"a");
        let (h1, m1) = fragment(1, 1, 2, b"b");
        assert!(table.add(&addr(1), h0, m0, now).is_none());
        assert!(table.add(&addr(2), h1, m1, now).is_none());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_incomplete_sets_expire() {
        let table = FragmentTable::new(Duration::from_millis(100), 64);
        let start = Instant::now();
        let (h0, m0) = fragment(1, 0, 2, b"a");
        table.add(&addr(1), h0, m0, start);
        assert_eq!(table.expire(start + Duration::from_millis(50)), 0);
        assert_eq!(table.expire(start + Duration::from_millis(100)), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_view_change_drops_departed_senders() {
        let table = FragmentTable::new(Duration::from_secs(1), 64);
        let now = Instant::now();
        for sender in [1, 2] {
            let (h, m) = fragment(1, 0, 2, b"a");
            table.add(&addr(sender), h, m, now);
        }
        let view = View::new(ViewId::new(addr(1), 3), vec![addr(1)]);
        assert_eq!(table.retain_members(&view), 1);
        assert_eq!(table.len(), 1);
    }
}
