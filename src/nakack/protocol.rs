//! NAKACK protocol implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::{Duration, Instant};

use super::history::{DigestOperation, DigestRecord};
use crate::address::Address;
use crate::message::{Flags, Header, Message, NakackHeader, ProtocolId, TransientFlags};
use crate::observability::{log_event_with_fields, Event as LogEvent, Logger, Severity};
use crate::retransmit::{RetransmitCommand, Retransmitter};
use crate::stack::{Event, Layer, NakackConfig, Protocol, StackError, StackResult};
use crate::sync::{lock, read, write, CondVar, Drainer};
use crate::timer::TaskHandle;
use crate::view::{Digest, DigestEntry, View};
use crate::window::{AckTable, AddResult, BoundedList, Interval, NakReceiverWindow, WindowStats};

/// Upper bound on one rebroadcast wait before requests are re-issued.
const REBROADCAST_RETRY: Duration = Duration::from_millis(200);

struct SenderEntry {
    window: Mutex<NakReceiverWindow<Message>>,
    drainer: Drainer,
    retransmitter: Retransmitter,
}

struct Inner {
    config: NakackConfig,
    interval: Interval,
    layer: OnceLock<Layer>,
    senders: RwLock<HashMap<Address, Arc<SenderEntry>>>,
    members: RwLock<Vec<Address>>,
    /// Per sender: highest seqno each member has delivered.
    stability: Mutex<HashMap<Address, AckTable>>,
    history: Mutex<BoundedList<DigestRecord>>,
    /// Bumped on every in-order delivery; rebroadcast waits on it.
    progress: CondVar<u64>,
    stable_task: Mutex<Option<TaskHandle>>,
    running: AtomicBool,
}

/// Reliable, per-sender FIFO multicast.
pub struct Nakack {
    inner: Arc<Inner>,
}

fn seqno_of(msg: &Message) -> Option<u64> {
    match msg.header(ProtocolId::NAKACK) {
        Some(Header::Nakack(NakackHeader::Msg { seqno }))
        | Some(Header::Nakack(NakackHeader::XmitResponse { seqno })) => Some(*seqno),
        _ => None,
    }
}

impl Nakack {
    pub fn new(config: NakackConfig) -> StackResult<Self> {
        let interval = config.xmit_interval.build()?;
        let history = BoundedList::new(config.digest_history_size)?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                interval,
                layer: OnceLock::new(),
                senders: RwLock::new(HashMap::new()),
                members: RwLock::new(Vec::new()),
                stability: Mutex::new(HashMap::new()),
                history: Mutex::new(history),
                progress: CondVar::new(0),
                stable_task: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
        })
    }

    /// Progress of every known sender.
    pub fn get_digest(&self) -> Digest {
        self.inner.get_digest()
    }

    /// Install a digest received when joining. An entry only replaces local
    /// state when it carries more progress; the local member's own entry
    /// is never touched.
    pub fn set_digest(&self, digest: &Digest) -> StackResult<()> {
        self.inner.install_digest(digest, DigestOperation::Set)
    }

    /// Install the consolidated digest of a merge. Same rules as
    /// `set_digest`.
    pub fn merge_digest(&self, digest: &Digest) -> StackResult<()> {
        self.inner.install_digest(digest, DigestOperation::Merge)
    }

    /// Replace every non-local entry with the digest's, even if that means
    /// less progress.
    pub fn overwrite_digest(&self, digest: &Digest) -> StackResult<()> {
        self.inner.install_digest(digest, DigestOperation::Overwrite)
    }

    /// Ask the group for every message `digest` has and this member lacks,
    /// re-asking until caught up or `timeout` elapses. Returns whether the
    /// local state caught up.
    pub fn rebroadcast(&self, digest: &Digest, timeout: Duration) -> bool {
        self.inner.rebroadcast(digest, timeout)
    }

    /// Run one stability round now: gossip the local digest and purge what
    /// every member has delivered.
    pub fn stable(&self) {
        self.inner.gossip();
    }

    /// Recently installed digests, oldest first.
    pub fn digest_history(&self) -> Vec<DigestRecord> {
        lock(&self.inner.history).iter().cloned().collect()
    }

    pub fn window_stats(&self, sender: &Address) -> Option<WindowStats> {
        let entry = self.inner.entry(sender)?;
        let stats = lock(&entry.window).stats();
        Some(stats)
    }

    pub fn loss_rate(&self, sender: &Address) -> Option<f64> {
        let entry = self.inner.entry(sender)?;
        let rate = lock(&entry.window).loss_rate();
        Some(rate)
    }

    /// Messages held for `sender`, delivered or not, until they become
    /// stable.
    pub fn window_size(&self, sender: &Address) -> Option<usize> {
        let entry = self.inner.entry(sender)?;
        let size = lock(&entry.window).size();
        Some(size)
    }

    /// Seqnos of `sender` still being recovered.
    pub fn pending_retransmissions(&self, sender: &Address) -> u64 {
        self.inner
            .entry(sender)
            .map(|e| e.retransmitter.size())
            .unwrap_or(0)
    }
}

impl Inner {
    fn layer(&self) -> StackResult<&Layer> {
        self.layer.get().ok_or(StackError::NotConnected)
    }

    fn entry(&self, sender: &Address) -> Option<Arc<SenderEntry>> {
        read(&self.senders).get(sender).cloned()
    }

    fn new_window(&self, marks: &DigestEntry) -> StackResult<NakReceiverWindow<Message>> {
        Ok(NakReceiverWindow::from_entry(
            marks,
            self.config.table_rows,
            self.config.table_row_len,
            self.config.resize_factor,
        )?)
    }

    fn new_entry(
        &self,
        layer: &Layer,
        sender: &Address,
        marks: &DigestEntry,
    ) -> StackResult<Arc<SenderEntry>> {
        let window = self.new_window(marks)?;
        let xmit_layer = layer.clone();
        let command: RetransmitCommand = Arc::new(move |low, high, original: &Address| {
            let header = NakackHeader::XmitRequest {
                sender: original.clone(),
                low,
                high,
            };
            let msg = Message::control(
                Some(original.clone()),
                ProtocolId::NAKACK,
                Header::Nakack(header),
            );
            xmit_layer.metrics().increment_xmit_requests_sent();
            let _ = xmit_layer.down(Event::Message(msg));
        });
        Ok(Arc::new(SenderEntry {
            window: Mutex::new(window),
            drainer: Drainer::new(),
            retransmitter: Retransmitter::new(
                sender.clone(),
                self.interval.fresh(),
                Arc::clone(layer.scheduler()),
                command,
            ),
        }))
    }

    fn start(self: &Arc<Self>) -> StackResult<()> {
        let layer = self.layer()?;
        let local = layer.local_address().clone();
        if self.entry(&local).is_none() {
            let entry = self.new_entry(layer, &local, &DigestEntry::default())?;
            write(&self.senders).insert(local.clone(), entry);
        }
        {
            let mut members = write(&self.members);
            if members.is_empty() {
                members.push(local);
            }
        }
        self.running.store(true, Ordering::Release);

        let period = self.config.stable_interval();
        if !period.is_zero() {
            let weak: Weak<Inner> = Arc::downgrade(self);
            let handle = layer.scheduler().schedule_at_fixed_rate(
                period,
                period,
                Arc::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.gossip();
                    }
                }),
            );
            if let Some(old) = lock(&self.stable_task).replace(handle) {
                old.cancel();
            }
        }
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(task) = lock(&self.stable_task).take() {
            task.cancel();
        }
        for entry in read(&self.senders).values() {
            entry.retransmitter.stop();
        }
        self.progress.notify_all();
    }

    // ==================
    // Send path
    // ==================

    fn send(&self, layer: &Layer, mut msg: Message) -> StackResult<()> {
        let local = layer.local_address().clone();
        let entry = self.entry(&local).ok_or(StackError::NotConnected)?;
        msg.set_src(local.clone());
        {
            let mut window = lock(&entry.window);
            let seqno = window.highest_received() + 1;
            msg.put_header(ProtocolId::NAKACK, Header::Nakack(NakackHeader::Msg { seqno }));
            window.add(seqno, msg.clone());
        }

        if msg.is_flag_set(Flags::OOB) && !msg.is_transient_flag_set(TransientFlags::DONT_LOOPBACK)
        {
            layer.up(Event::Message(msg.clone()));
        }
        // Local delivery happens from the own window, not the transport.
        layer.down(Event::Message(
            msg.with_transient_flags(TransientFlags::DONT_LOOPBACK),
        ))?;
        self.deliver(layer, &entry, &local);
        Ok(())
    }

    // ==================
    // Receive path
    // ==================

    fn handle(&self, layer: &Layer, msg: Message) {
        let header = match msg.header(ProtocolId::NAKACK) {
            Some(Header::Nakack(h)) => h.clone(),
            _ => {
                layer.up(Event::Message(msg));
                return;
            }
        };
        match header {
            NakackHeader::Msg { seqno } | NakackHeader::XmitResponse { seqno } => {
                self.handle_message(layer, seqno, msg)
            }
            NakackHeader::XmitRequest { sender, low, high } => {
                if let Some(requester) = msg.src() {
                    self.handle_xmit_request(layer, requester, &sender, low, high);
                }
            }
            NakackHeader::Stable { digest } => {
                if let Some(from) = msg.src() {
                    self.handle_stable(from, &digest);
                }
            }
        }
    }

    fn handle_message(&self, layer: &Layer, seqno: u64, msg: Message) {
        let Some(sender) = msg.src().cloned() else {
            return;
        };
        let Some(entry) = self.entry(&sender) else {
            if Logger::enabled(Severity::Trace) {
                Logger::trace(
                    "NAKACK_UNKNOWN_SENDER",
                    &[("sender", &sender.to_string()), ("seqno", &seqno.to_string())],
                );
            }
            return;
        };

        let oob = msg.is_flag_set(Flags::OOB).then(|| msg.clone());
        let result = lock(&entry.window).add(seqno, msg);
        match result {
            AddResult::Added { gap } => {
                if let Some(gap) = gap {
                    layer.metrics().add_missing_messages(gap.count());
                    entry.retransmitter.add(gap.low, gap.high);
                }
                entry.retransmitter.remove(seqno);
                if let Some(msg) = oob {
                    layer.up(Event::Message(msg));
                }
                self.deliver(layer, &entry, &sender);
            }
            AddResult::Duplicate | AddResult::Stale => {
                layer.metrics().increment_duplicates_discarded();
            }
        }
    }

    /// Pass every deliverable message of `sender` up, in seqno order. Only
    /// one thread delivers per sender at a time.
    fn deliver(&self, layer: &Layer, entry: &SenderEntry, sender: &Address) {
        let own = sender == layer.local_address();
        let max = self.config.max_delivery_batch;
        entry.drainer.run(|| loop {
            let batch = lock(&entry.window).remove_many(max);
            if batch.is_empty() {
                return;
            }
            self.progress.update(|p| *p += batch.len() as u64);
            for msg in batch {
                // OOB messages went up when they arrived.
                if msg.is_flag_set(Flags::OOB) {
                    continue;
                }
                if own && msg.is_transient_flag_set(TransientFlags::DONT_LOOPBACK) {
                    continue;
                }
                layer.up(Event::Message(msg));
            }
        });
    }

    fn handle_xmit_request(
        &self,
        layer: &Layer,
        requester: &Address,
        original: &Address,
        low: u64,
        high: u64,
    ) {
        layer.metrics().increment_xmit_requests_received();
        if requester == layer.local_address() {
            return;
        }
        let Some(entry) = self.entry(original) else {
            return;
        };
        let messages = {
            let window = lock(&entry.window);
            let top = high.min(window.highest_received());
            if low > top {
                return;
            }
            window.get_range(low, top)
        };
        for stored in messages {
            let Some(seqno) = seqno_of(&stored) else {
                continue;
            };
            let mut resp = stored.copy(true);
            resp.set_dest(Some(requester.clone()));
            resp.put_header(
                ProtocolId::NAKACK,
                Header::Nakack(NakackHeader::XmitResponse { seqno }),
            );
            layer.metrics().increment_xmit_responses_sent();
            let _ = layer.down(Event::Message(resp));
        }
    }

    fn handle_stable(&self, from: &Address, digest: &Digest) {
        if !read(&self.members).contains(from) {
            return;
        }
        let mut purge = Vec::new();
        {
            let mut tables = lock(&self.stability);
            for (sender, entry) in digest.iter() {
                if let Some(table) = tables.get_mut(sender) {
                    table.ack(from, entry.highest_delivered);
                    if let Some(min) = table.min() {
                        purge.push((sender.clone(), min));
                    }
                }
            }
        }
        for (sender, min) in purge {
            if let Some(entry) = self.entry(&sender) {
                lock(&entry.window).stable(min);
            }
        }

        // The gossiper's own entry is how far it has sent; whatever lies
        // beyond our highest received was lost at the tail.
        if let (Some(theirs), Some(entry)) = (digest.get(from), self.entry(from)) {
            let received = lock(&entry.window).highest_received();
            let requested = entry
                .retransmitter
                .missing()
                .iter()
                .map(|r| r.high)
                .max()
                .unwrap_or(0);
            let low = received.max(requested) + 1;
            if theirs.highest_received >= low {
                if let Ok(layer) = self.layer() {
                    layer
                        .metrics()
                        .add_missing_messages(theirs.highest_received - low + 1);
                }
                entry.retransmitter.add(low, theirs.highest_received);
            }
        }
    }

    fn gossip(&self) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        let Ok(layer) = self.layer() else {
            return;
        };
        let digest = self.get_digest();
        self.handle_stable(layer.local_address(), &digest);
        let msg = Message::control(
            None,
            ProtocolId::NAKACK,
            Header::Nakack(NakackHeader::Stable { digest }),
        )
        .with_transient_flags(TransientFlags::DONT_LOOPBACK);
        let _ = layer.down(Event::Message(msg));
    }

    // ==================
    // Membership and digests
    // ==================

    fn handle_view_change(&self, view: &View) -> StackResult<()> {
        let layer = self.layer()?;
        let members = view.members();
        let removed: Vec<Arc<SenderEntry>> = {
            let mut senders = write(&self.senders);
            let gone: Vec<Address> = senders
                .keys()
                .filter(|a| !members.contains(a))
                .cloned()
                .collect();
            let removed = gone.iter().filter_map(|a| senders.remove(a)).collect();
            for member in members {
                if !senders.contains_key(member) {
                    let entry = self.new_entry(layer, member, &DigestEntry::default())?;
                    senders.insert(member.clone(), entry);
                }
            }
            removed
        };
        for entry in removed {
            entry.retransmitter.stop();
            lock(&entry.window).destroy();
        }
        {
            let mut tables = lock(&self.stability);
            tables.retain(|sender, _| members.contains(sender));
            for sender in members {
                tables.entry(sender.clone()).or_default().adjust(members);
            }
        }
        *write(&self.members) = members.to_vec();
        Ok(())
    }

    fn get_digest(&self) -> Digest {
        let senders = read(&self.senders);
        let mut digest = Digest::new();
        for (sender, entry) in senders.iter() {
            digest.insert(sender.clone(), lock(&entry.window).digest_entry());
        }
        digest
    }

    fn install_digest(&self, digest: &Digest, op: DigestOperation) -> StackResult<()> {
        let layer = self.layer()?;
        let local = layer.local_address();
        {
            let mut senders = write(&self.senders);
            for (sender, theirs) in digest.iter() {
                if sender == local {
                    continue;
                }
                let hd = theirs.highest_delivered;
                let entry = match senders.get(sender) {
                    Some(entry) => {
                        let mut window = lock(&entry.window);
                        let replace = match op {
                            DigestOperation::Overwrite => true,
                            DigestOperation::Set | DigestOperation::Merge => {
                                hd > window.highest_delivered()
                            }
                        };
                        if !replace {
                            continue;
                        }
                        let mut fresh = self.new_window(theirs)?;
                        // Keep what was already buffered above the new mark.
                        for s in hd + 1..=window.highest_received() {
                            if let Some(m) = window.get(s) {
                                fresh.add(s, m.clone());
                            }
                        }
                        window.destroy();
                        *window = fresh;
                        entry.retransmitter.reset();
                        Arc::clone(entry)
                    }
                    None => {
                        let entry = self.new_entry(layer, sender, theirs)?;
                        senders.insert(sender.clone(), Arc::clone(&entry));
                        entry
                    }
                };
                // The digest says more exists; fetch it.
                let missing = lock(&entry.window).missing();
                for gap in missing {
                    layer.metrics().add_missing_messages(gap.count());
                    entry.retransmitter.add(gap.low, gap.high);
                }
            }
        }
        lock(&self.history).add(DigestRecord::now(op, digest.clone()));
        log_event_with_fields(
            LogEvent::DigestInstalled,
            &[
                ("operation", op.as_str()),
                ("digest", &digest.to_string()),
            ],
        );
        Ok(())
    }

    fn rebroadcast(&self, digest: &Digest, timeout: Duration) -> bool {
        let Ok(layer) = self.layer() else {
            return false;
        };
        let local = layer.local_address().clone();
        log_event_with_fields(
            LogEvent::RebroadcastStarted,
            &[("digest", &digest.to_string())],
        );
        let deadline = Instant::now() + timeout;
        loop {
            let seen = *self.progress.lock();
            let mine = self.get_digest();
            let behind: Vec<(Address, u64, u64)> = digest
                .iter()
                .filter(|(sender, _)| **sender != local)
                .filter_map(|(sender, theirs)| {
                    let have = mine.get(sender)?.highest_delivered;
                    (have < theirs.highest()).then(|| (sender.clone(), have + 1, theirs.highest()))
                })
                .collect();
            if behind.is_empty() {
                log_event_with_fields(
                    LogEvent::RebroadcastCompleted,
                    &[("digest", &mine.to_string())],
                );
                return true;
            }
            let now = Instant::now();
            if now >= deadline || !self.running.load(Ordering::Acquire) {
                return false;
            }
            for (sender, low, high) in behind {
                let msg = Message::control(
                    None,
                    ProtocolId::NAKACK,
                    Header::Nakack(NakackHeader::XmitRequest { sender, low, high }),
                )
                .with_transient_flags(TransientFlags::DONT_LOOPBACK);
                layer.metrics().increment_xmit_requests_sent();
                let _ = layer.down(Event::Message(msg));
            }
            let wait = (deadline - now).min(REBROADCAST_RETRY);
            self.progress.wait_for(|p| *p != seen, Some(wait));
        }
    }
}

impl Protocol for Nakack {
    fn name(&self) -> &'static str {
        "NAKACK"
    }

    fn id(&self) -> Option<ProtocolId> {
        Some(ProtocolId::NAKACK)
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
            Event::Message(msg)
                if msg.is_multicast() && !msg.is_flag_set(Flags::NO_RELIABILITY) =>
            {
                self.inner.send(layer, msg)
            }
            Event::ViewChange(view) => {
                self.inner.handle_view_change(&view)?;
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
                let mine = batch.take_matching(|m| m.header(ProtocolId::NAKACK).is_some());
                for msg in mine {
                    self.inner.handle(layer, msg);
                }
                if !batch.is_empty() {
                    layer.up(Event::Batch(batch));
                }
            }
            evt => layer.up(evt),
        }
    }
}

impl std::fmt::Debug for Nakack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nakack")
            .field("senders", &read(&self.inner.senders).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageBatch;
    use crate::stack::testing::{addr, harness, Harness};
    use crate::view::ViewId;

    fn config() -> NakackConfig {
        NakackConfig {
            stable_interval_ms: 0,
            ..NakackConfig::default()
        }
    }

    fn setup(members: &[u128]) -> (Harness, Arc<Nakack>) {
        let nakack = Arc::new(Nakack::new(config()).unwrap());
        let h = harness(addr(1), vec![nakack.clone()]);
        let members: Vec<Address> = members.iter().map(|n| addr(*n)).collect();
        let view = View::new(ViewId::new(addr(1), 1), members);
        h.stack.down(Event::ViewChange(view)).unwrap();
        (h, nakack)
    }

    fn data(seqno: u64, payload: &str) -> Message {
        let mut msg = Message::new(None, payload.as_bytes().to_vec());
        msg.put_header(ProtocolId::NAKACK, Header::Nakack(NakackHeader::Msg { seqno }));
        msg
    }

    #[test]
    fn test_send_assigns_seqnos_and_delivers_locally() {
        let (h, nakack) = setup(&[1, 2]);
        h.send(Message::new(None, &b"a"[..])).unwrap();
        h.send(Message::new(None, &b"b"[..])).unwrap();

        assert_eq!(h.app.payloads(), vec!["a", "b"]);
        let sent = h.wire.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(seqno_of(&sent[0]), Some(1));
        assert_eq!(seqno_of(&sent[1]), Some(2));
        assert!(sent[0].is_transient_flag_set(TransientFlags::DONT_LOOPBACK));
        assert_eq!(nakack.get_digest().get(&addr(1)).unwrap().highest_delivered, 2);
    }

    #[test]
    fn test_dont_loopback_suppresses_only_local_delivery() {
        let (h, _nakack) = setup(&[1, 2]);
        let quiet =
            Message::new(None, &b"quiet"[..]).with_transient_flags(TransientFlags::DONT_LOOPBACK);
        h.send(quiet).unwrap();
        h.send(Message::new(None, &b"loud"[..])).unwrap();

        assert_eq!(h.app.payloads(), vec!["loud"]);
        let sent = h.wire.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(&sent[0].payload()[..], b"quiet");
        assert_eq!(seqno_of(&sent[0]), Some(1));

        // The flag only concerns the sender's own copy.
        h.wire.receive(
            &addr(2),
            data(1, "remote").with_transient_flags(TransientFlags::DONT_LOOPBACK),
        );
        assert_eq!(h.app.payloads(), vec!["loud", "remote"]);
    }

    #[test]
    fn test_unicast_and_unreliable_pass_through() {
        let (h, _nakack) = setup(&[1, 2]);
        h.send(Message::new(Some(addr(2)), &b"u"[..])).unwrap();
        h.send(Message::new(None, &b"n"[..]).with_flags(Flags::NO_RELIABILITY))
            .unwrap();
        let sent = h.wire.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|m| m.header(ProtocolId::NAKACK).is_none()));
        assert!(h.app.payloads().is_empty());
    }

    #[test]
    fn test_gap_is_recovered_in_order() {
        let (h, nakack) = setup(&[1, 2]);
        let b = addr(2);
        h.wire.receive(&b, data(1, "1"));
        h.wire.receive(&b, data(3, "3"));
        assert_eq!(h.app.payloads(), vec!["1"]);
        assert_eq!(nakack.pending_retransmissions(&b), 1);

        h.scheduler.advance(Duration::from_millis(50));
        let requests: Vec<_> = h
            .wire
            .sent_with(ProtocolId::NAKACK)
            .into_iter()
            .filter(|(_, hdr)| matches!(hdr, Header::Nakack(NakackHeader::XmitRequest { .. })))
            .collect();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0.dest(), Some(&b));
        assert_eq!(
            requests[0].1,
            Header::Nakack(NakackHeader::XmitRequest {
                sender: b.clone(),
                low: 2,
                high: 2
            })
        );

        let mut resp = data(2, "2");
        resp.put_header(
            ProtocolId::NAKACK,
            Header::Nakack(NakackHeader::XmitResponse { seqno: 2 }),
        );
        h.wire.receive(&b, resp);
        assert_eq!(h.app.payloads(), vec!["1", "2", "3"]);
        assert_eq!(nakack.pending_retransmissions(&b), 0);
        let snap = h.stack.metrics().snapshot();
        assert_eq!(snap.missing_messages, 1);
        assert_eq!(snap.xmit_requests_sent, 1);
    }

    #[test]
    fn test_duplicates_and_unknown_senders_dropped() {
        let (h, _nakack) = setup(&[1, 2]);
        h.wire.receive(&addr(2), data(1, "x"));
        h.wire.receive(&addr(2), data(1, "x"));
        h.wire.receive(&addr(9), data(1, "stranger"));
        assert_eq!(h.app.payloads(), vec!["x"]);
        assert_eq!(h.stack.metrics().snapshot().duplicates_discarded, 1);
    }

    #[test]
    fn test_oob_delivered_on_arrival_once() {
        let (h, _nakack) = setup(&[1, 2]);
        let b = addr(2);
        h.wire.receive(&b, data(2, "late").with_flags(Flags::OOB));
        h.wire.receive(&b, data(1, "first"));
        h.wire.receive(&b, data(3, "third"));
        assert_eq!(h.app.payloads(), vec!["late", "first", "third"]);
    }

    #[test]
    fn test_batch_handled_per_message() {
        let (h, _nakack) = setup(&[1, 2]);
        let b = addr(2);
        let msgs = (1..=3)
            .map(|s| {
                let mut m = data(s, &s.to_string());
                m.set_src(b.clone());
                m
            })
            .collect();
        h.wire
            .inject(Event::Batch(MessageBatch::new(None, b, "c", true, msgs)));
        assert_eq!(h.app.payloads(), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_xmit_request_served_with_original_source() {
        let (h, _nakack) = setup(&[1, 2]);
        h.send(Message::new(None, &b"x"[..])).unwrap();
        h.send(Message::new(None, &b"y"[..])).unwrap();
        h.wire.take();

        let req = Message::control(
            None,
            ProtocolId::NAKACK,
            Header::Nakack(NakackHeader::XmitRequest {
                sender: addr(1),
                low: 1,
                high: 10,
            }),
        );
        h.wire.receive(&addr(2), req);

        let sent = h.wire.take();
        assert_eq!(sent.len(), 2);
        for (i, m) in sent.iter().enumerate() {
            assert_eq!(m.dest(), Some(&addr(2)));
            assert_eq!(m.src(), Some(&addr(1)));
            assert_eq!(
                m.header(ProtocolId::NAKACK),
                Some(&Header::Nakack(NakackHeader::XmitResponse {
                    seqno: i as u64 + 1
                }))
            );
        }
        assert_eq!(h.stack.metrics().snapshot().xmit_responses_sent, 2);
    }

    #[test]
    fn test_stable_purges_once_every_member_delivered() {
        let (h, nakack) = setup(&[1, 2]);
        h.send(Message::new(None, &b"x"[..])).unwrap();
        h.send(Message::new(None, &b"y"[..])).unwrap();
        assert_eq!(nakack.window_size(&addr(1)), Some(2));

        nakack.stable();
        assert_eq!(nakack.window_size(&addr(1)), Some(2));
        assert!(h
            .wire
            .sent_with(ProtocolId::NAKACK)
            .iter()
            .any(|(_, hdr)| matches!(hdr, Header::Nakack(NakackHeader::Stable { .. }))));

        let digest = Digest::new().with(addr(1), 0, 2, 2).with(addr(2), 0, 0, 0);
        let gossip = Message::control(
            None,
            ProtocolId::NAKACK,
            Header::Nakack(NakackHeader::Stable { digest }),
        );
        h.wire.receive(&addr(2), gossip);
        assert_eq!(nakack.window_size(&addr(1)), Some(0));
        assert_eq!(nakack.get_digest().get(&addr(1)).unwrap().low, 2);
    }

    #[test]
    fn test_stable_from_non_member_ignored() {
        let (h, nakack) = setup(&[1, 2]);
        h.send(Message::new(None, &b"x"[..])).unwrap();
        nakack.stable();
        let digest = Digest::new().with(addr(1), 0, 1, 1);
        let gossip = Message::control(
            None,
            ProtocolId::NAKACK,
            Header::Nakack(NakackHeader::Stable { digest }),
        );
        h.wire.receive(&addr(7), gossip);
        assert_eq!(nakack.window_size(&addr(1)), Some(1));
    }

    #[test]
    fn test_stable_gossip_reveals_tail_loss() {
        let (h, nakack) = setup(&[1, 2]);
        h.wire.receive(&addr(2), data(1, "a"));
        let gossip = || {
            Message::control(
                None,
                ProtocolId::NAKACK,
                Header::Nakack(NakackHeader::Stable {
                    digest: Digest::new().with(addr(2), 0, 3, 3),
                }),
            )
        };
        h.wire.receive(&addr(2), gossip());
        assert_eq!(nakack.pending_retransmissions(&addr(2)), 2);
        h.wire.receive(&addr(2), gossip());
        assert_eq!(nakack.pending_retransmissions(&addr(2)), 2);
    }

    #[test]
    fn test_set_digest_only_moves_forward() {
        let (_h, nakack) = setup(&[1, 2]);
        let b = addr(2);
        nakack
            .set_digest(&Digest::new().with(b.clone(), 0, 5, 5).with(addr(1), 0, 9, 9))
            .unwrap();
        assert_eq!(nakack.get_digest().get(&b), Some(&DigestEntry::new(0, 5, 5)));
        assert_eq!(nakack.get_digest().get(&addr(1)).unwrap().highest_delivered, 0);

        nakack.merge_digest(&Digest::new().with(b.clone(), 0, 3, 3)).unwrap();
        assert_eq!(nakack.get_digest().get(&b), Some(&DigestEntry::new(0, 5, 5)));

        nakack.overwrite_digest(&Digest::new().with(b.clone(), 0, 3, 3)).unwrap();
        assert_eq!(nakack.get_digest().get(&b), Some(&DigestEntry::new(0, 3, 3)));

        let ops: Vec<_> = nakack.digest_history().iter().map(|r| r.operation).collect();
        assert_eq!(
            ops,
            vec![
                DigestOperation::Set,
                DigestOperation::Merge,
                DigestOperation::Overwrite
            ]
        );
    }

    #[test]
    fn test_forward_digest_installed_exactly() {
        let (_h, nakack) = setup(&[1, 2]);
        let b = addr(2);
        nakack.set_digest(&Digest::new().with(b.clone(), 0, 2, 2)).unwrap();
        nakack.set_digest(&Digest::new().with(b.clone(), 1, 5, 8)).unwrap();

        assert_eq!(nakack.get_digest().get(&b), Some(&DigestEntry::new(1, 5, 8)));
        assert_eq!(nakack.pending_retransmissions(&b), 3);
    }

    #[test]
    fn test_digest_ahead_of_local_state_is_fetched() {
        let (_h, nakack) = setup(&[1, 2]);
        let c = addr(3);
        nakack.set_digest(&Digest::new().with(c.clone(), 0, 2, 4)).unwrap();
        assert_eq!(nakack.get_digest().get(&c).unwrap().highest_delivered, 2);
        assert_eq!(nakack.pending_retransmissions(&c), 2);
    }

    #[test]
    fn test_view_change_drops_departed_senders() {
        let (h, nakack) = setup(&[1, 2]);
        h.wire.receive(&addr(2), data(1, "x"));
        assert!(nakack.window_stats(&addr(2)).is_some());
        let view = View::new(ViewId::new(addr(1), 2), vec![addr(1)]);
        h.stack.down(Event::ViewChange(view)).unwrap();
        assert!(nakack.window_stats(&addr(2)).is_none());
        assert_eq!(h.wire.events(), vec!["VIEW_CHANGE", "VIEW_CHANGE"]);
    }

    #[test]
    fn test_rebroadcast_returns_once_caught_up() {
        let (h, nakack) = setup(&[1, 2]);
        let b = addr(2);
        assert!(nakack.rebroadcast(&Digest::new().with(b.clone(), 0, 0, 0), Duration::ZERO));

        h.wire.receive(&b, data(1, "1"));
        let wanted = Digest::new().with(b.clone(), 0, 2, 2);
        assert!(!nakack.rebroadcast(&wanted, Duration::from_millis(10)));
        assert!(h.wire.sent_with(ProtocolId::NAKACK).iter().any(|(m, hdr)| {
            m.is_multicast()
                && *hdr
                    == Header::Nakack(NakackHeader::XmitRequest {
                        sender: b.clone(),
                        low: 2,
                        high: 2,
                    })
        }));

        h.wire.receive(&b, data(2, "2"));
        assert!(nakack.rebroadcast(&wanted, Duration::from_millis(10)));
    }
}
