//! Per-peer connection state.
//!
//! Each direction of a peer pair is its own connection: the sender picks the
//! connection id and numbers messages from 1; the receiver keeps one window
//! per peer, keyed by the id the peer chose.

use std::fmt;
use std::time::Instant;

use serde::Serialize;

use crate::message::{Header, Message, ProtocolId, UnicastHeader};
use crate::window::{AckReceiverWindow, RetransmitTable, WindowResult};

/// Lifecycle of the sending side of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Closed,
    /// `Connect` sent, no acknowledgment seen yet
    Connecting,
    Open,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Closed => "closed",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sending side: numbering and the unacknowledged messages.
pub(crate) struct SendEntry {
    pub(crate) conn_id: u32,
    pub(crate) state: ConnectionState,
    pub(crate) next_seqno: u64,
    pub(crate) unacked: RetransmitTable<Message>,
    pub(crate) highest_acked: u64,
    /// `highest_acked` as of the previous tail-loss sweep
    pub(crate) acked_at_sweep: u64,
    pub(crate) last_active: Instant,
}

impl SendEntry {
    pub(crate) fn new(
        conn_id: u32,
        rows: usize,
        row_len: usize,
        resize_factor: f64,
        now: Instant,
    ) -> WindowResult<Self> {
        Ok(Self {
            conn_id,
            state: ConnectionState::Connecting,
            next_seqno: 1,
            unacked: RetransmitTable::new(rows, row_len, 1, resize_factor)?,
            highest_acked: 0,
            acked_at_sweep: 0,
            last_active: now,
        })
    }

    /// Number and store `msg`.
    pub(crate) fn assign(&mut self, mut msg: Message, now: Instant) -> Message {
        let seqno = self.next_seqno;
        self.next_seqno += 1;
        msg.put_header(
            ProtocolId::UNICAST,
            Header::Unicast(UnicastHeader::Data {
                conn_id: self.conn_id,
                seqno,
            }),
        );
        self.unacked.put(seqno, msg.clone());
        self.last_active = now;
        msg
    }

    pub(crate) fn highest_sent(&self) -> u64 {
        self.next_seqno - 1
    }

    pub(crate) fn has_unacked(&self) -> bool {
        self.highest_acked < self.highest_sent()
    }

    /// Unacknowledged messages in seqno order.
    pub(crate) fn pending(&self) -> Vec<Message> {
        (self.highest_acked + 1..self.next_seqno)
            .filter_map(|s| self.unacked.get(s).cloned())
            .collect()
    }

    /// Record a cumulative ack. Returns false if it acknowledged nothing new.
    pub(crate) fn ack(&mut self, seqno: u64, now: Instant) -> bool {
        let seqno = seqno.min(self.highest_sent());
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Open;
        }
        if seqno <= self.highest_acked {
            return false;
        }
        self.highest_acked = seqno;
        self.unacked.purge(seqno);
        self.last_active = now;
        true
    }
}

/// Receiving side: the in-order window for one peer's connection.
pub(crate) struct RecvEntry {
    pub(crate) conn_id: u32,
    pub(crate) window: AckReceiverWindow<Message>,
    /// Highest seqno seen, delivered or buffered
    pub(crate) highest_seen: u64,
    pub(crate) last_active: Instant,
}

impl RecvEntry {
    pub(crate) fn new(conn_id: u32, now: Instant) -> Self {
        Self::resume(conn_id, 0, now)
    }

    /// Entry for a connection whose messages up to `delivered` were already
    /// handed up.
    pub(crate) fn resume(conn_id: u32, delivered: u64, now: Instant) -> Self {
        Self {
            conn_id,
            window: AckReceiverWindow::new(delivered + 1),
            highest_seen: delivered,
            last_active: now,
        }
    }

    /// Highest seqno passed up to the application.
    pub(crate) fn delivered(&self) -> u64 {
        self.window.next_to_remove() - 1
    }

    /// Highest seqno received without gaps.
    pub(crate) fn contiguous(&self) -> u64 {
        // Messages above the first gap are not acknowledged yet.
        match self.window.missing().first() {
            Some(gap) => gap.low - 1,
            None => self
                .window
                .highest_received()
                .unwrap_or(0)
                .max(self.window.next_to_remove() - 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry() -> SendEntry {
        SendEntry::new(7, 4, 8, 1.5, Instant::now()).unwrap()
    }

    #[test]
    fn test_assign_numbers_from_one() {
        let mut e = entry();
        let now = Instant::now();
        let a = e.assign(Message::new(None, &b"a"[..]), now);
        let b = e.assign(Message::new(None, &b"b"[..]), now);
        assert_eq!(
            a.header(ProtocolId::UNICAST),
            Some(&Header::Unicast(UnicastHeader::Data { conn_id: 7, seqno: 1 }))
        );
        assert_eq!(
            b.header(ProtocolId::UNICAST),
            Some(&Header::Unicast(UnicastHeader::Data { conn_id: 7, seqno: 2 }))
        );
        assert_eq!(e.pending().len(), 2);
        assert!(e.has_unacked());
    }

    #[test]
    fn test_ack_purges_and_opens() {
        let mut e = entry();
        let now = Instant::now();
        for _ in 0..3 {
            e.assign(Message::new(None, &b"x"[..]), now);
        }
        assert_eq!(e.state, ConnectionState::Connecting);
        assert!(e.ack(2, now + Duration::from_millis(1)));
        assert_eq!(e.state, ConnectionState::Open);
        assert_eq!(e.pending().len(), 1);
        assert!(!e.ack(1, now));
        // Acks past what was sent are clamped.
        assert!(e.ack(10, now));
        assert!(!e.has_unacked());
    }

    #[test]
    fn test_resumed_entry_rejects_delivered_seqnos() {
        let mut r = RecvEntry::resume(3, 5, Instant::now());
        assert_eq!(r.delivered(), 5);
        assert_eq!(r.contiguous(), 5);
        assert!(!r.window.add(5, Message::new(None, &b"5"[..])));
        assert!(r.window.add(6, Message::new(None, &b"6"[..])));
        assert_eq!(r.window.remove_many(10).len(), 1);
        assert_eq!(r.delivered(), 6);
    }

    #[test]
    fn test_contiguous_stops_at_first_gap() {
        let mut r = RecvEntry::new(1, Instant::now());
        r.window.add(1, Message::new(None, &b"1"[..]));
        r.window.add(2, Message::new(None, &b"2"[..]));
        r.window.add(4, Message::new(None, &b"4"[..]));
        assert_eq!(r.contiguous(), 2);
        r.window.remove_many(10);
        assert_eq!(r.contiguous(), 2);
        r.window.add(3, Message::new(None, &b"3"[..]));
        assert_eq!(r.contiguous(), 4);
    }
}
