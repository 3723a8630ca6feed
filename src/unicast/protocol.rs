//! UNICAST protocol implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::Instant;

use rand::Rng;

use super::connection::{ConnectionState, RecvEntry, SendEntry};
use crate::address::Address;
use crate::message::{ConnSide, Flags, Header, Message, ProtocolId, UnicastHeader};
use crate::observability::{log_event_with_fields, Event as LogEvent, Logger, Severity};
use crate::retransmit::{RetransmitCommand, Retransmitter};
use crate::stack::{Event, Layer, Protocol, StackError, StackResult, UnicastConfig};
use crate::sync::{lock, read, write, Drainer};
use crate::timer::TaskHandle;
use crate::view::View;
use crate::window::{Interval, RetransmitTable};

const MAX_DELIVERY_BATCH: usize = 100;

struct Peer {
    send: Mutex<Option<SendEntry>>,
    recv: Mutex<Option<RecvEntry>>,
    /// Receiving connection closed earlier: its id and the highest seqno
    /// delivered on it. Late copies of its messages are acked, not delivered.
    retired: Mutex<Option<(u32, u64)>>,
    drainer: Drainer,
    /// Gaps in what the peer sent us
    retransmitter: Retransmitter,
}

struct Inner {
    config: UnicastConfig,
    interval: Interval,
    layer: OnceLock<Layer>,
    peers: RwLock<HashMap<Address, Arc<Peer>>>,
    next_conn_id: AtomicU32,
    sweep_task: Mutex<Option<TaskHandle>>,
    running: AtomicBool,
}

/// Reliable, ordered point-to-point delivery.
pub struct Unicast {
    inner: Arc<Inner>,
}

fn control(dest: &Address, header: UnicastHeader) -> Message {
    Message::control(
        Some(dest.clone()),
        ProtocolId::UNICAST,
        Header::Unicast(header),
    )
}

impl Unicast {
    pub fn new(config: UnicastConfig) -> StackResult<Self> {
        let interval = config.xmit_interval.build()?;
        // Reject bad table parameters now rather than on the first send.
        RetransmitTable::<Message>::new(
            config.table_rows,
            config.table_row_len,
            1,
            config.resize_factor,
        )?;
        let first_id = rand::thread_rng().gen_range(1..u32::MAX / 2);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                interval,
                layer: OnceLock::new(),
                peers: RwLock::new(HashMap::new()),
                next_conn_id: AtomicU32::new(first_id),
                sweep_task: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
        })
    }

    /// State of the sending side of the connection to `peer`.
    pub fn connection_state(&self, peer: &Address) -> ConnectionState {
        self.inner
            .existing(peer)
            .and_then(|p| lock(&p.send).as_ref().map(|e| e.state))
            .unwrap_or(ConnectionState::Closed)
    }

    /// Unacknowledged messages to `peer`.
    pub fn unacked(&self, peer: &Address) -> usize {
        self.inner
            .existing(peer)
            .and_then(|p| lock(&p.send).as_ref().map(|e| e.pending().len()))
            .unwrap_or(0)
    }

    /// Close connections idle for longer than the configured expiry.
    /// Returns how many connection sides were closed.
    pub fn expire_idle(&self) -> usize {
        self.inner.expire_idle()
    }
}

impl Peer {
    /// Close the receiving connection, remembering how far it got. Caller
    /// holds the `recv` lock.
    fn retire(&self, recv: &mut Option<RecvEntry>) {
        if let Some(entry) = recv.take() {
            *lock(&self.retired) = Some((entry.conn_id, entry.delivered()));
            self.retransmitter.reset();
        }
    }

    /// Highest delivered seqno of `conn_id` if it was retired.
    fn retired_at(&self, conn_id: u32) -> Option<u64> {
        let retired = *lock(&self.retired);
        retired
            .filter(|(id, _)| *id == conn_id)
            .map(|(_, delivered)| delivered)
    }

    /// Fresh receive entry for `conn_id`, continuing after what was
    /// delivered if the connection had been retired.
    fn open_recv(&self, conn_id: u32, now: Instant) -> RecvEntry {
        let mut retired = lock(&self.retired);
        let entry = match *retired {
            Some((id, delivered)) if id == conn_id => {
                *retired = None;
                RecvEntry::resume(conn_id, delivered, now)
            }
            _ => RecvEntry::new(conn_id, now),
        };
        self.retransmitter.reset();
        entry
    }
}

impl Inner {
    fn layer(&self) -> StackResult<&Layer> {
        self.layer.get().ok_or(StackError::NotConnected)
    }

    fn existing(&self, addr: &Address) -> Option<Arc<Peer>> {
        read(&self.peers).get(addr).cloned()
    }

    fn peer(self: &Arc<Self>, layer: &Layer, addr: &Address) -> Arc<Peer> {
        if let Some(peer) = self.existing(addr) {
            return peer;
        }
        let mut peers = write(&self.peers);
        let peer = peers.entry(addr.clone()).or_insert_with(|| {
            let weak: Weak<Inner> = Arc::downgrade(self);
            let command: RetransmitCommand = Arc::new(move |low, high, sender: &Address| {
                if let Some(inner) = weak.upgrade() {
                    inner.request_retransmission(sender, low, high);
                }
            });
            Arc::new(Peer {
                send: Mutex::new(None),
                recv: Mutex::new(None),
                retired: Mutex::new(None),
                drainer: Drainer::new(),
                retransmitter: Retransmitter::new(
                    addr.clone(),
                    self.interval.fresh(),
                    Arc::clone(layer.scheduler()),
                    command,
                ),
            })
        });
        Arc::clone(peer)
    }

    fn start(self: &Arc<Self>) -> StackResult<()> {
        let layer = self.layer()?;
        self.running.store(true, Ordering::Release);
        let period = self.config.resend_interval();
        if !period.is_zero() {
            let weak: Weak<Inner> = Arc::downgrade(self);
            let handle = layer.scheduler().schedule_at_fixed_rate(
                period,
                period,
                Arc::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.sweep();
                    }
                }),
            );
            if let Some(old) = lock(&self.sweep_task).replace(handle) {
                old.cancel();
            }
        }
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(task) = lock(&self.sweep_task).take() {
            task.cancel();
        }
        for peer in read(&self.peers).values() {
            peer.retransmitter.stop();
        }
    }

    /// A fresh sending side; unacknowledged messages of `old` are renumbered
    /// onto it. Returns the entry and the messages to send, `Connect` first.
    fn reopen(
        &self,
        old: Option<SendEntry>,
        dest: &Address,
        now: Instant,
    ) -> StackResult<(SendEntry, Vec<Message>)> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed).max(1);
        let mut entry = SendEntry::new(
            conn_id,
            self.config.table_rows,
            self.config.table_row_len,
            self.config.resize_factor,
            now,
        )?;
        let mut out = vec![control(dest, UnicastHeader::Connect { conn_id })];
        if let Some(old) = old {
            for msg in old.pending() {
                out.push(entry.assign(msg, now));
            }
        }
        if Logger::enabled(Severity::Trace) {
            Logger::trace(
                "UNICAST_CONNECTING",
                &[
                    ("peer", &dest.to_string()),
                    ("conn_id", &conn_id.to_string()),
                    ("resent", &(out.len() - 1).to_string()),
                ],
            );
        }
        Ok((entry, out))
    }

    // ==================
    // Sending side
    // ==================

    fn send(self: &Arc<Self>, layer: &Layer, dest: Address, msg: Message) -> StackResult<()> {
        let peer = self.peer(layer, &dest);
        let now = layer.scheduler().now();
        let mut out = Vec::new();
        {
            let mut send = lock(&peer.send);
            let usable = matches!(send.as_ref(), Some(e) if e.state != ConnectionState::Closed);
            if !usable {
                let (entry, msgs) = self.reopen(send.take(), &dest, now)?;
                *send = Some(entry);
                out = msgs;
            }
            if let Some(entry) = send.as_mut() {
                out.push(entry.assign(msg, now));
            }
        }
        for m in out {
            layer.down(Event::Message(m))?;
        }
        Ok(())
    }

    fn handle_ack(&self, layer: &Layer, from: &Address, conn_id: u32, seqno: u64) {
        let Some(peer) = self.existing(from) else {
            return;
        };
        let opened = {
            let mut send = lock(&peer.send);
            match send.as_mut() {
                Some(e) if e.conn_id == conn_id => {
                    let was_connecting = e.state == ConnectionState::Connecting;
                    e.ack(seqno, layer.scheduler().now());
                    was_connecting
                }
                _ => false,
            }
        };
        if opened {
            log_opened(from, conn_id);
        }
    }

    fn handle_connect_ack(&self, from: &Address, conn_id: u32) {
        let Some(peer) = self.existing(from) else {
            return;
        };
        let opened = {
            let mut send = lock(&peer.send);
            match send.as_mut() {
                Some(e) if e.conn_id == conn_id && e.state == ConnectionState::Connecting => {
                    e.state = ConnectionState::Open;
                    true
                }
                _ => false,
            }
        };
        if opened {
            log_opened(from, conn_id);
        }
    }

    fn handle_xmit_request(&self, layer: &Layer, from: &Address, conn_id: u32, low: u64, high: u64) {
        layer.metrics().increment_xmit_requests_received();
        let Some(peer) = self.existing(from) else {
            return;
        };
        let messages: Vec<Message> = {
            let send = lock(&peer.send);
            match send.as_ref() {
                Some(e) if e.conn_id == conn_id => (low..=high.min(e.highest_sent()))
                    .filter_map(|s| e.unacked.get(s).cloned())
                    .collect(),
                _ => return,
            }
        };
        for msg in messages {
            layer.metrics().increment_xmit_responses_sent();
            let _ = layer.down(Event::Message(msg));
        }
    }

    /// `Send`: the peer closed its sending side, so our receiving entry goes.
    /// `Receive`: the peer does not know our sending side; reopen it.
    fn handle_close(
        self: &Arc<Self>,
        layer: &Layer,
        from: &Address,
        conn_id: u32,
        side: ConnSide,
    ) {
        let Some(peer) = self.existing(from) else {
            return;
        };
        if side == ConnSide::Send {
            let mut recv = lock(&peer.recv);
            if recv.as_ref().map(|r| r.conn_id) == Some(conn_id) {
                peer.retire(&mut recv);
                log_event_with_fields(
                    LogEvent::ConnectionClosed,
                    &[
                        ("peer", &from.to_string()),
                        ("conn_id", &conn_id.to_string()),
                        ("reason", "closed_by_peer"),
                    ],
                );
            }
            return;
        }
        let now = layer.scheduler().now();
        let out = {
            let mut send = lock(&peer.send);
            if send.as_ref().map(|e| e.conn_id) != Some(conn_id) {
                return;
            }
            match self.reopen(send.take(), from, now) {
                Ok((entry, msgs)) => {
                    *send = Some(entry);
                    msgs
                }
                Err(_) => return,
            }
        };
        log_event_with_fields(
            LogEvent::ConnectionClosed,
            &[
                ("peer", &from.to_string()),
                ("conn_id", &conn_id.to_string()),
                ("reason", "unknown_at_peer"),
            ],
        );
        for m in out {
            let _ = layer.down(Event::Message(m));
        }
    }

    fn handle_connection_reset(&self, peer_addr: &Address) {
        let Some(peer) = self.existing(peer_addr) else {
            return;
        };
        let closed = {
            let mut send = lock(&peer.send);
            match send.as_mut() {
                Some(e) if e.state != ConnectionState::Closed => {
                    // Unacknowledged messages are kept and renumbered on reconnect.
                    e.state = ConnectionState::Closed;
                    Some(e.conn_id)
                }
                _ => None,
            }
        };
        if let Some(conn_id) = closed {
            log_event_with_fields(
                LogEvent::ConnectionClosed,
                &[
                    ("peer", &peer_addr.to_string()),
                    ("conn_id", &conn_id.to_string()),
                    ("reason", "reset"),
                ],
            );
        }
    }

    // ==================
    // Receiving side
    // ==================

    fn handle_connect(self: &Arc<Self>, layer: &Layer, from: &Address, conn_id: u32) {
        let peer = self.peer(layer, from);
        {
            let mut recv = lock(&peer.recv);
            if recv.as_ref().map(|r| r.conn_id) != Some(conn_id) {
                *recv = Some(peer.open_recv(conn_id, layer.scheduler().now()));
            }
        }
        let _ = layer.down(Event::Message(control(
            from,
            UnicastHeader::ConnectAck { conn_id },
        )));
    }

    fn handle_data(
        self: &Arc<Self>,
        layer: &Layer,
        from: &Address,
        conn_id: u32,
        seqno: u64,
        msg: Message,
    ) {
        let peer = self.peer(layer, from);
        let now = layer.scheduler().now();
        let (added, ack) = {
            let mut recv = lock(&peer.recv);
            if recv.as_ref().map(|r| r.conn_id) != Some(conn_id) {
                let retired = peer.retired_at(conn_id);
                if let Some(delivered) = retired.filter(|d| seqno <= *d) {
                    drop(recv);
                    layer.metrics().increment_duplicates_discarded();
                    let _ = layer.down(Event::Message(control(
                        from,
                        UnicastHeader::Ack {
                            conn_id,
                            seqno: delivered,
                        },
                    )));
                    return;
                }
                if retired.is_none() && seqno != 1 {
                    drop(recv);
                    if Logger::enabled(Severity::Trace) {
                        Logger::trace(
                            "UNICAST_UNKNOWN_CONNECTION",
                            &[
                                ("peer", &from.to_string()),
                                ("conn_id", &conn_id.to_string()),
                                ("seqno", &seqno.to_string()),
                            ],
                        );
                    }
                    let _ = layer.down(Event::Message(control(
                        from,
                        UnicastHeader::Close {
                            conn_id,
                            side: ConnSide::Receive,
                        },
                    )));
                    return;
                }
                // First message of a connection whose Connect was lost, or
                // new data on one that expired here.
                *recv = Some(peer.open_recv(conn_id, now));
            }
            let Some(entry) = recv.as_mut() else {
                return;
            };
            entry.last_active = now;
            let oob = msg.is_flag_set(Flags::OOB).then(|| msg.clone());
            let added = if entry.window.add(seqno, msg) {
                let gap = (seqno > entry.highest_seen + 1)
                    .then(|| (entry.highest_seen + 1, seqno - 1));
                entry.highest_seen = entry.highest_seen.max(seqno);
                Some((gap, oob))
            } else {
                None
            };
            (added, entry.contiguous())
        };

        match added {
            Some((gap, oob)) => {
                if let Some((low, high)) = gap {
                    layer.metrics().add_missing_messages(high - low + 1);
                    peer.retransmitter.add(low, high);
                }
                peer.retransmitter.remove(seqno);
                if let Some(msg) = oob {
                    layer.up(Event::Message(msg));
                }
                self.deliver(layer, &peer);
            }
            None => layer.metrics().increment_duplicates_discarded(),
        }
        if ack > 0 {
            let _ = layer.down(Event::Message(control(
                from,
                UnicastHeader::Ack { conn_id, seqno: ack },
            )));
        }
    }

    fn deliver(&self, layer: &Layer, peer: &Peer) {
        peer.drainer.run(|| loop {
            let batch = match lock(&peer.recv).as_mut() {
                Some(r) => r.window.remove_many(MAX_DELIVERY_BATCH),
                None => Vec::new(),
            };
            if batch.is_empty() {
                return;
            }
            for msg in batch {
                if !msg.is_flag_set(Flags::OOB) {
                    layer.up(Event::Message(msg));
                }
            }
        });
    }

    /// Retransmitter callback: ask `sender` for `[low, high]` again.
    fn request_retransmission(&self, sender: &Address, low: u64, high: u64) {
        let Ok(layer) = self.layer() else {
            return;
        };
        let Some(peer) = self.existing(sender) else {
            return;
        };
        let Some(conn_id) = lock(&peer.recv).as_ref().map(|r| r.conn_id) else {
            return;
        };
        layer.metrics().increment_xmit_requests_sent();
        let _ = layer.down(Event::Message(control(
            sender,
            UnicastHeader::XmitRequest { conn_id, low, high },
        )));
    }

    fn handle(self: &Arc<Self>, layer: &Layer, msg: Message) {
        let header = match msg.header(ProtocolId::UNICAST) {
            Some(Header::Unicast(h)) => *h,
            _ => {
                layer.up(Event::Message(msg));
                return;
            }
        };
        let Some(from) = msg.src().cloned() else {
            return;
        };
        match header {
            UnicastHeader::Data { conn_id, seqno } => {
                self.handle_data(layer, &from, conn_id, seqno, msg)
            }
            UnicastHeader::Ack { conn_id, seqno } => self.handle_ack(layer, &from, conn_id, seqno),
            UnicastHeader::Connect { conn_id } => self.handle_connect(layer, &from, conn_id),
            UnicastHeader::ConnectAck { conn_id } => self.handle_connect_ack(&from, conn_id),
            UnicastHeader::XmitRequest { conn_id, low, high } => {
                self.handle_xmit_request(layer, &from, conn_id, low, high)
            }
            UnicastHeader::Close { conn_id, side } => {
                self.handle_close(layer, &from, conn_id, side)
            }
        }
    }

    // ==================
    // Maintenance
    // ==================

    /// Re-send `Connect` for pending connections, and the newest
    /// unacknowledged message where acks made no progress since last time.
    fn sweep(&self) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        let Ok(layer) = self.layer() else {
            return;
        };
        let peers: Vec<(Address, Arc<Peer>)> = read(&self.peers)
            .iter()
            .map(|(a, p)| (a.clone(), Arc::clone(p)))
            .collect();
        let mut out = Vec::new();
        for (addr, peer) in peers {
            let mut send = lock(&peer.send);
            let Some(e) = send.as_mut() else {
                continue;
            };
            if e.state == ConnectionState::Closed {
                continue;
            }
            if e.state == ConnectionState::Connecting {
                out.push(control(&addr, UnicastHeader::Connect { conn_id: e.conn_id }));
            }
            if e.has_unacked() && e.highest_acked == e.acked_at_sweep {
                if let Some(tail) = e.unacked.get(e.highest_sent()) {
                    out.push(tail.clone());
                }
            }
            e.acked_at_sweep = e.highest_acked;
        }
        for m in out {
            let _ = layer.down(Event::Message(m));
        }
        self.expire_idle();
    }

    fn expire_idle(&self) -> usize {
        let expiry = self.config.conn_expiry();
        let Ok(layer) = self.layer() else {
            return 0;
        };
        if expiry.is_zero() {
            return 0;
        }
        let now = layer.scheduler().now();
        let peers: Vec<(Address, Arc<Peer>)> = read(&self.peers)
            .iter()
            .map(|(a, p)| (a.clone(), Arc::clone(p)))
            .collect();
        let mut expired = 0;
        let mut out = Vec::new();
        for (addr, peer) in peers {
            {
                let mut send = lock(&peer.send);
                if let Some(e) = send.as_mut() {
                    let idle = now.saturating_duration_since(e.last_active);
                    if e.state != ConnectionState::Closed && !e.has_unacked() && idle >= expiry {
                        e.state = ConnectionState::Closed;
                        out.push(control(
                            &addr,
                            UnicastHeader::Close {
                                conn_id: e.conn_id,
                                side: ConnSide::Send,
                            },
                        ));
                        expired += 1;
                        log_expired(&addr, e.conn_id, "send");
                    }
                }
            }
            let mut recv = lock(&peer.recv);
            let stale = recv
                .as_ref()
                .map(|r| (r.conn_id, now.saturating_duration_since(r.last_active) >= expiry));
            if let Some((conn_id, true)) = stale {
                peer.retire(&mut recv);
                expired += 1;
                log_expired(&addr, conn_id, "receive");
            }
        }
        for m in out {
            let _ = layer.down(Event::Message(m));
        }
        expired
    }

    fn handle_view_change(&self, view: &View) {
        let removed: Vec<(Address, Arc<Peer>)> = {
            let mut peers = write(&self.peers);
            let gone: Vec<Address> = peers
                .keys()
                .filter(|a| !view.contains(a))
                .cloned()
                .collect();
            gone.into_iter()
                .filter_map(|a| peers.remove(&a).map(|p| (a, p)))
                .collect()
        };
        for (addr, peer) in removed {
            peer.retransmitter.stop();
            if let Some(e) = lock(&peer.send).take() {
                log_event_with_fields(
                    LogEvent::ConnectionClosed,
                    &[
                        ("peer", &addr.to_string()),
                        ("conn_id", &e.conn_id.to_string()),
                        ("reason", "left_view"),
                    ],
                );
            }
        }
    }
}

fn log_opened(peer: &Address, conn_id: u32) {
    log_event_with_fields(
        LogEvent::ConnectionOpened,
        &[("peer", &peer.to_string()), ("conn_id", &conn_id.to_string())],
    );
}

fn log_expired(peer: &Address, conn_id: u32, side: &str) {
    log_event_with_fields(
        LogEvent::ConnectionExpired,
        &[
            ("peer", &peer.to_string()),
            ("conn_id", &conn_id.to_string()),
            ("side", side),
        ],
    );
}

impl Protocol for Unicast {
    fn name(&self) -> &'static str {
        "UNICAST"
    }

    fn id(&self) -> Option<ProtocolId> {
        Some(ProtocolId::UNICAST)
    }

    fn init(&self, layer: Layer) -> StackResult<()> {
        let _ = self.inner.layer.set(layer);
        Ok(())
    }

    fn start(&self) -> StackResult<()> {
        self.inner.start()
    }

    fn stop(&self) {
        self.inner.stop();
    }

    fn down(&self, evt: Event) -> StackResult<()> {
        let layer = self.inner.layer()?;
        match evt {
            Event::Message(msg) => match msg.dest().cloned() {
                Some(dest)
                    if dest != *layer.local_address()
                        && !msg.is_flag_set(Flags::NO_RELIABILITY) =>
                {
                    self.inner.send(layer, dest, msg)
                }
                _ => layer.down(Event::Message(msg)),
            },
            Event::ViewChange(view) => {
                self.inner.handle_view_change(&view);
                layer.down(Event::ViewChange(view))
            }
            evt => layer.down(evt),
        }
    }

    fn up(&self, evt: Event) {
        let Ok(layer) = self.inner.layer() else {
            return;
        };
        match evt {
            Event::Message(msg) => self.inner.handle(layer, msg),
            Event::Batch(mut batch) => {
                let mine = batch.take_matching(|m| m.header(ProtocolId::UNICAST).is_some());
                for msg in mine {
                    self.inner.handle(layer, msg);
                }
                if !batch.is_empty() {
                    layer.up(Event::Batch(batch));
                }
            }
            Event::ConnectionReset(peer) => {
                self.inner.handle_connection_reset(&peer);
                layer.up(Event::ConnectionReset(peer));
            }
            evt => layer.up(evt),
        }
    }
}

impl std::fmt::Debug for Unicast {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unicast")
            .field("peers", &read(&self.inner.peers).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::testing::{addr, harness, Harness};
    use crate::view::ViewId;
    use std::time::Duration;

    fn setup(config: UnicastConfig) -> (Harness, Arc<Unicast>) {
        let unicast = Arc::new(Unicast::new(config).unwrap());
        let h = harness(addr(1), vec![unicast.clone()]);
        (h, unicast)
    }

    fn quiet() -> UnicastConfig {
        UnicastConfig {
            resend_interval_ms: 0,
            conn_expiry_ms: 0,
            ..UnicastConfig::default()
        }
    }

    fn headers(h: &Harness) -> Vec<UnicastHeader> {
        h.wire
            .take()
            .iter()
            .filter_map(|m| match m.header(ProtocolId::UNICAST) {
                Some(Header::Unicast(u)) => Some(*u),
                _ => None,
            })
            .collect()
    }

    fn data(conn_id: u32, seqno: u64, payload: &str) -> Message {
        let mut msg = Message::new(Some(addr(1)), payload.as_bytes().to_vec());
        msg.put_header(
            ProtocolId::UNICAST,
            Header::Unicast(UnicastHeader::Data { conn_id, seqno }),
        );
        msg
    }

    fn from_peer(header: UnicastHeader) -> Message {
        control(&addr(1), header)
    }

    #[test]
    fn test_first_send_connects_and_numbers() {
        let (h, unicast) = setup(quiet());
        let b = addr(2);
        h.send(Message::new(Some(b.clone()), &b"x"[..])).unwrap();
        let sent = headers(&h);
        let UnicastHeader::Connect { conn_id } = sent[0] else {
            panic!("expected connect, got {:?}", sent);
        };
        assert_eq!(sent[1], UnicastHeader::Data { conn_id, seqno: 1 });
        assert_eq!(unicast.connection_state(&b), ConnectionState::Connecting);

        h.wire.receive(&b, from_peer(UnicastHeader::ConnectAck { conn_id }));
        assert_eq!(unicast.connection_state(&b), ConnectionState::Open);
        assert_eq!(unicast.unacked(&b), 1);
        h.wire.receive(&b, from_peer(UnicastHeader::Ack { conn_id, seqno: 1 }));
        assert_eq!(unicast.unacked(&b), 0);
    }

    #[test]
    fn test_receiver_orders_acks_and_requests_gaps() {
        let (h, _unicast) = setup(quiet());
        let b = addr(2);
        h.wire.receive(&b, from_peer(UnicastHeader::Connect { conn_id: 9 }));
        assert_eq!(headers(&h), vec![UnicastHeader::ConnectAck { conn_id: 9 }]);

        h.wire.receive(&b, data(9, 1, "1"));
        h.wire.receive(&b, data(9, 3, "3"));
        assert_eq!(h.app.payloads(), vec!["1"]);
        assert_eq!(
            headers(&h),
            vec![
                UnicastHeader::Ack { conn_id: 9, seqno: 1 },
                UnicastHeader::Ack { conn_id: 9, seqno: 1 }
            ]
        );

        h.scheduler.advance(Duration::from_millis(50));
        assert_eq!(
            headers(&h),
            vec![UnicastHeader::XmitRequest {
                conn_id: 9,
                low: 2,
                high: 2
            }]
        );

        h.wire.receive(&b, data(9, 2, "2"));
        assert_eq!(h.app.payloads(), vec!["1", "2", "3"]);
        assert_eq!(headers(&h), vec![UnicastHeader::Ack { conn_id: 9, seqno: 3 }]);

        h.wire.receive(&b, data(9, 2, "2"));
        assert_eq!(h.stack.metrics().snapshot().duplicates_discarded, 1);
    }

    #[test]
    fn test_lost_connect_opens_on_first_message() {
        let (h, _unicast) = setup(quiet());
        h.wire.receive(&addr(2), data(4, 1, "a"));
        assert_eq!(h.app.payloads(), vec!["a"]);
    }

    #[test]
    fn test_unknown_connection_answered_with_close() {
        let (h, _unicast) = setup(quiet());
        h.wire.receive(&addr(2), data(5, 4, "late"));
        assert!(h.app.payloads().is_empty());
        assert_eq!(
            headers(&h),
            vec![UnicastHeader::Close {
                conn_id: 5,
                side: ConnSide::Receive
            }]
        );
    }

    #[test]
    fn test_close_from_peer_renumbers_unacked() {
        let (h, unicast) = setup(quiet());
        let b = addr(2);
        h.send(Message::new(Some(b.clone()), &b"x"[..])).unwrap();
        h.send(Message::new(Some(b.clone()), &b"y"[..])).unwrap();
        let UnicastHeader::Connect { conn_id } = headers(&h)[0] else {
            panic!("expected connect");
        };

        h.wire.receive(
            &b,
            from_peer(UnicastHeader::Close {
                conn_id,
                side: ConnSide::Receive,
            }),
        );
        let sent = h.wire.take();
        let hdrs: Vec<_> = sent
            .iter()
            .filter_map(|m| match m.header(ProtocolId::UNICAST) {
                Some(Header::Unicast(u)) => Some(*u),
                _ => None,
            })
            .collect();
        let UnicastHeader::Connect { conn_id: renewed } = hdrs[0] else {
            panic!("expected connect, got {:?}", hdrs);
        };
        assert_ne!(renewed, conn_id);
        assert_eq!(hdrs[1], UnicastHeader::Data { conn_id: renewed, seqno: 1 });
        assert_eq!(hdrs[2], UnicastHeader::Data { conn_id: renewed, seqno: 2 });
        assert_eq!(&sent[1].payload()[..], b"x");
        assert_eq!(&sent[2].payload()[..], b"y");
        assert_eq!(unicast.unacked(&b), 2);
    }

    #[test]
    fn test_reset_connection_reconnects_on_next_send() {
        let (h, unicast) = setup(quiet());
        let b = addr(2);
        h.send(Message::new(Some(b.clone()), &b"x"[..])).unwrap();
        let UnicastHeader::Connect { conn_id } = headers(&h)[0] else {
            panic!("expected connect");
        };
        h.wire.inject(Event::ConnectionReset(b.clone()));
        assert_eq!(unicast.connection_state(&b), ConnectionState::Closed);

        h.send(Message::new(Some(b.clone()), &b"y"[..])).unwrap();
        let hdrs = headers(&h);
        let UnicastHeader::Connect { conn_id: renewed } = hdrs[0] else {
            panic!("expected connect, got {:?}", hdrs);
        };
        assert_ne!(renewed, conn_id);
        assert_eq!(hdrs.len(), 3);
        assert_eq!(hdrs[2], UnicastHeader::Data { conn_id: renewed, seqno: 2 });
    }

    #[test]
    fn test_sweep_resends_tail_without_ack_progress() {
        let (h, _unicast) = setup(UnicastConfig {
            resend_interval_ms: 100,
            conn_expiry_ms: 0,
            ..UnicastConfig::default()
        });
        let b = addr(2);
        h.send(Message::new(Some(b.clone()), &b"x"[..])).unwrap();
        h.send(Message::new(Some(b.clone()), &b"y"[..])).unwrap();
        let UnicastHeader::Connect { conn_id } = headers(&h)[0] else {
            panic!("expected connect");
        };
        h.wire.receive(&b, from_peer(UnicastHeader::Ack { conn_id, seqno: 1 }));

        // Acks progressed since the start: nothing resent.
        h.scheduler.advance(Duration::from_millis(100));
        assert!(headers(&h).is_empty());

        h.scheduler.advance(Duration::from_millis(100));
        assert_eq!(headers(&h), vec![UnicastHeader::Data { conn_id, seqno: 2 }]);
    }

    #[test]
    fn test_xmit_request_served_from_unacked() {
        let (h, _unicast) = setup(quiet());
        let b = addr(2);
        for p in ["a", "b", "c"] {
            h.send(Message::new(Some(b.clone()), p.as_bytes().to_vec())).unwrap();
        }
        let UnicastHeader::Connect { conn_id } = headers(&h)[0] else {
            panic!("expected connect");
        };
        h.wire.receive(
            &b,
            from_peer(UnicastHeader::XmitRequest {
                conn_id,
                low: 2,
                high: 9,
            }),
        );
        assert_eq!(
            headers(&h),
            vec![
                UnicastHeader::Data { conn_id, seqno: 2 },
                UnicastHeader::Data { conn_id, seqno: 3 }
            ]
        );
    }

    #[test]
    fn test_idle_connections_expire() {
        let (h, unicast) = setup(UnicastConfig {
            resend_interval_ms: 0,
            conn_expiry_ms: 1000,
            ..UnicastConfig::default()
        });
        let b = addr(2);
        h.send(Message::new(Some(b.clone()), &b"x"[..])).unwrap();
        let UnicastHeader::Connect { conn_id } = headers(&h)[0] else {
            panic!("expected connect");
        };
        assert_eq!(unicast.expire_idle(), 0);

        h.wire.receive(&b, from_peer(UnicastHeader::Ack { conn_id, seqno: 1 }));
        h.scheduler.advance(Duration::from_millis(1000));
        assert_eq!(unicast.expire_idle(), 1);
        assert_eq!(unicast.connection_state(&b), ConnectionState::Closed);
        assert_eq!(
            headers(&h),
            vec![UnicastHeader::Close {
                conn_id,
                side: ConnSide::Send
            }]
        );
    }

    fn expiring() -> UnicastConfig {
        UnicastConfig {
            resend_interval_ms: 0,
            conn_expiry_ms: 1000,
            ..UnicastConfig::default()
        }
    }

    #[test]
    fn test_expired_receive_side_drops_resent_first_message() {
        let (h, unicast) = setup(expiring());
        let b = addr(2);
        h.wire.receive(&b, from_peer(UnicastHeader::Connect { conn_id: 9 }));
        h.wire.receive(&b, data(9, 1, "x"));
        h.wire.take();

        h.scheduler.advance(Duration::from_millis(1000));
        assert_eq!(unicast.expire_idle(), 1);

        h.wire.receive(&b, data(9, 1, "x"));
        assert_eq!(h.app.payloads(), vec!["x"]);
        assert_eq!(headers(&h), vec![UnicastHeader::Ack { conn_id: 9, seqno: 1 }]);
        assert_eq!(h.stack.metrics().snapshot().duplicates_discarded, 1);
    }

    #[test]
    fn test_expired_receive_side_acks_old_and_resumes_new() {
        let (h, unicast) = setup(expiring());
        let b = addr(2);
        h.wire.receive(&b, from_peer(UnicastHeader::Connect { conn_id: 9 }));
        h.wire.receive(&b, data(9, 1, "x"));
        h.wire.receive(&b, data(9, 2, "y"));
        h.wire.take();

        h.scheduler.advance(Duration::from_millis(1000));
        assert_eq!(unicast.expire_idle(), 1);

        // The sender's tail resend is acknowledged instead of triggering a
        // Close that would make it renumber delivered messages.
        h.wire.receive(&b, data(9, 2, "y"));
        assert_eq!(headers(&h), vec![UnicastHeader::Ack { conn_id: 9, seqno: 2 }]);

        h.wire.receive(&b, data(9, 4, "w"));
        h.wire.receive(&b, data(9, 3, "z"));
        assert_eq!(h.app.payloads(), vec!["x", "y", "z", "w"]);
    }

    #[test]
    fn test_send_side_close_only_retires_receiving_connection() {
        let (h, unicast) = setup(quiet());
        let b = addr(2);
        h.send(Message::new(Some(b.clone()), &b"out"[..])).unwrap();
        let UnicastHeader::Connect { conn_id } = headers(&h)[0] else {
            panic!("expected connect");
        };
        // The peer happens to use the same id for its own direction.
        h.wire.receive(&b, data(conn_id, 1, "in"));
        h.wire.take();

        h.wire.receive(
            &b,
            from_peer(UnicastHeader::Close {
                conn_id,
                side: ConnSide::Send,
            }),
        );
        assert!(headers(&h).is_empty());
        assert_eq!(unicast.connection_state(&b), ConnectionState::Connecting);
        assert_eq!(unicast.unacked(&b), 1);

        h.wire.receive(&b, data(conn_id, 1, "in"));
        assert_eq!(h.app.payloads(), vec!["in"]);
    }

    #[test]
    fn test_view_change_forgets_departed_peers() {
        let (h, unicast) = setup(quiet());
        let b = addr(2);
        h.send(Message::new(Some(b.clone()), &b"x"[..])).unwrap();
        let view = View::new(ViewId::new(addr(1), 2), vec![addr(1)]);
        h.stack.down(Event::ViewChange(view)).unwrap();
        assert_eq!(unicast.connection_state(&b), ConnectionState::Closed);
        assert_eq!(unicast.unacked(&b), 0);
    }

    #[test]
    fn test_multicast_and_self_pass_through() {
        let (h, _unicast) = setup(quiet());
        h.send(Message::new(None, &b"m"[..])).unwrap();
        h.send(Message::new(Some(addr(1)), &b"me"[..])).unwrap();
        assert_eq!(h.wire.sent().len(), 2);
        assert!(headers(&h).is_empty());
    }
}
