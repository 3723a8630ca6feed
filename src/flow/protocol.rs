//! Flow control protocol (multicast and unicast modes).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use super::credit_map::CreditMap;
use super::non_blocking::{Admission, NonBlockingCreditMap};
use crate::address::Address;
use crate::message::{Flags, FlowHeader, Header, Message, ProtocolId};
use crate::observability::{log_event_with_fields, Event as LogEvent};
use crate::stack::{Event, FlowConfig, Layer, Protocol, StackError, StackResult};
use crate::sync::{lock, read, write};
use crate::view::View;

/// Which messages a flow control instance governs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowMode {
    /// Multicasts, credited by every member
    Multicast,
    /// Unicasts, credited per destination
    Unicast,
}

impl FlowMode {
    fn governs(&self, msg: &Message) -> bool {
        match self {
            FlowMode::Multicast => msg.is_multicast(),
            FlowMode::Unicast => !msg.is_multicast(),
        }
    }
}

enum Credits {
    Blocking(CreditMap),
    Queueing(NonBlockingCreditMap),
}

impl Credits {
    fn new(config: &FlowConfig) -> Self {
        if config.non_blocking {
            Credits::Queueing(NonBlockingCreditMap::new(
                config.max_credits,
                config.max_queue_size,
            ))
        } else {
            Credits::Blocking(CreditMap::new(config.max_credits))
        }
    }

    fn map(&self) -> &CreditMap {
        match self {
            Credits::Blocking(m) => m,
            Credits::Queueing(q) => q.credits(),
        }
    }

    fn replenish(&self, member: &Address, credits: u64) -> Vec<Message> {
        match self {
            Credits::Blocking(m) => {
                m.replenish(member, credits);
                Vec::new()
            }
            Credits::Queueing(q) => q.replenish(member, credits),
        }
    }

    fn remove(&self, member: &Address) -> Vec<Message> {
        match self {
            Credits::Blocking(m) => {
                m.remove(member);
                Vec::new()
            }
            Credits::Queueing(q) => q.remove(member),
        }
    }

    fn queued(&self) -> usize {
        match self {
            Credits::Blocking(_) => 0,
            Credits::Queueing(q) => q.queued_messages(),
        }
    }

    fn reset(&self) {
        match self {
            Credits::Blocking(m) => m.reset(),
            Credits::Queueing(q) => q.reset(),
        }
    }
}

struct Inner {
    mode: FlowMode,
    id: ProtocolId,
    config: FlowConfig,
    layer: OnceLock<Layer>,
    /// Multicast mode: credits granted by every other member
    multicast: Arc<Credits>,
    /// Unicast mode: credits granted by each destination
    unicast: RwLock<HashMap<Address, Arc<Credits>>>,
    /// Bytes received per sender since the last replenishment
    received: Mutex<HashMap<Address, u64>>,
    running: AtomicBool,
}

/// Credit-based flow control: senders spend credits per byte, receivers
/// grant them back once they have consumed enough.
pub struct FlowControl {
    inner: Arc<Inner>,
}

impl FlowControl {
    pub fn new(mode: FlowMode, config: FlowConfig) -> StackResult<Self> {
        if config.max_credits == 0 {
            return Err(StackError::config("max_credits must be > 0"));
        }
        if !(config.min_threshold > 0.0 && config.min_threshold <= 1.0) {
            return Err(StackError::config(format!(
                "min_threshold must be in (0, 1], got {}",
                config.min_threshold
            )));
        }
        let id = match mode {
            FlowMode::Multicast => ProtocolId::FLOW_MULTICAST,
            FlowMode::Unicast => ProtocolId::FLOW_UNICAST,
        };
        Ok(Self {
            inner: Arc::new(Inner {
                mode,
                id,
                multicast: Arc::new(Credits::new(&config)),
                config,
                layer: OnceLock::new(),
                unicast: RwLock::new(HashMap::new()),
                received: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
            }),
        })
    }

    pub fn mode(&self) -> FlowMode {
        self.inner.mode
    }

    /// Credits available for sending to `dest` (`None` for multicasts).
    pub fn min_credits(&self, dest: Option<&Address>) -> Option<u64> {
        match (self.inner.mode, dest) {
            (FlowMode::Multicast, None) => Some(self.inner.multicast.map().min_credits()),
            (FlowMode::Unicast, Some(d)) => read(&self.inner.unicast)
                .get(d)
                .map(|c| c.map().min_credits()),
            _ => None,
        }
    }

    /// Messages waiting for credits (non-blocking mode).
    pub fn queued_messages(&self) -> usize {
        match self.inner.mode {
            FlowMode::Multicast => self.inner.multicast.queued(),
            FlowMode::Unicast => read(&self.inner.unicast).values().map(|c| c.queued()).sum(),
        }
    }

    /// Bytes received from `sender` not yet credited back.
    pub fn received_from(&self, sender: &Address) -> u64 {
        lock(&self.inner.received).get(sender).copied().unwrap_or(0)
    }
}

impl Inner {
    fn layer(&self) -> StackResult<&Layer> {
        self.layer.get().ok_or(StackError::NotConnected)
    }

    fn subject_to_credits(&self, msg: &Message) -> bool {
        self.mode.governs(msg)
            && !msg.is_flag_set(Flags::NO_FC)
            && !msg.is_flag_set(Flags::INTERNAL)
            && !msg.is_empty()
    }

    fn credits_for(&self, dest: Option<&Address>) -> Option<Arc<Credits>> {
        match (self.mode, dest) {
            (FlowMode::Multicast, None) => Some(Arc::clone(&self.multicast)),
            (FlowMode::Unicast, Some(dest)) => {
                if let Some(c) = read(&self.unicast).get(dest) {
                    return Some(Arc::clone(c));
                }
                let mut unicast = write(&self.unicast);
                let c = unicast.entry(dest.clone()).or_insert_with(|| {
                    let c = Credits::new(&self.config);
                    c.map().put_if_absent(dest);
                    Arc::new(c)
                });
                Some(Arc::clone(c))
            }
            _ => None,
        }
    }

    fn control(&self, dest: &Address, header: FlowHeader) -> Message {
        Message::control(Some(dest.clone()), self.id, Header::Flow(header))
            .with_flags(Flags::OOB | Flags::NO_FC)
    }

    // ==================
    // Sending side
    // ==================

    fn send(&self, layer: &Layer, msg: Message) -> StackResult<()> {
        let Some(credits) = self.credits_for(msg.dest()) else {
            return layer.down(Event::Message(msg));
        };
        let needed = (msg.len() as u64).min(self.config.max_credits);
        match credits.as_ref() {
            Credits::Blocking(map) => {
                if !map.try_decrement(needed) {
                    layer.metrics().increment_credit_blocks();
                    self.request_credits(layer, map, needed);
                    let timeout = self.config.max_block_time();
                    if timeout.is_zero() || !map.decrement(needed, timeout) {
                        log_event_with_fields(
                            LogEvent::FlowControlBlocked,
                            &[
                                ("mode", self.mode_name()),
                                ("needed", &needed.to_string()),
                                ("min_credits", &map.min_credits().to_string()),
                                ("timeout_ms", &timeout.as_millis().to_string()),
                            ],
                        );
                    }
                }
                layer.down(Event::Message(msg))
            }
            Credits::Queueing(queue) => match queue.decrement(msg, needed) {
                Admission::Admitted(msg) => layer.down(Event::Message(msg)),
                Admission::Queued => {
                    layer.metrics().increment_queued_messages();
                    self.request_credits(layer, queue.credits(), needed);
                    Ok(())
                }
                Admission::Rejected(_) => Err(StackError::invalid_state(format!(
                    "{} flow control queue full ({} bytes queued)",
                    self.mode_name(),
                    queue.queued_bytes()
                ))),
            },
        }
    }

    fn request_credits(&self, layer: &Layer, map: &CreditMap, needed: u64) {
        for member in map.members_with_insufficient_credits(needed) {
            let _ = layer.down(Event::Message(
                self.control(&member, FlowHeader::CreditRequest { requested: needed }),
            ));
        }
    }

    fn handle_replenish(&self, layer: &Layer, from: &Address, credits: u64) {
        let released = match self.mode {
            FlowMode::Multicast => self.multicast.replenish(from, credits),
            FlowMode::Unicast => match read(&self.unicast).get(from).cloned() {
                Some(c) => c.replenish(from, credits),
                None => Vec::new(),
            },
        };
        for msg in released {
            let _ = layer.down(Event::Message(msg));
        }
    }

    // ==================
    // Receiving side
    // ==================

    /// Count `msg` against its sender; returns credits to grant back.
    fn account(&self, layer: &Layer, msg: &Message) -> Option<(Address, u64)> {
        if !self.subject_to_credits(msg) {
            return None;
        }
        let src = msg.src()?;
        if src == layer.local_address() {
            return None;
        }
        let threshold = self.config.replenish_threshold().max(1);
        let mut received = lock(&self.received);
        let total = received.entry(src.clone()).or_insert(0);
        *total += msg.len() as u64;
        if *total < threshold {
            return None;
        }
        Some((src.clone(), std::mem::take(total)))
    }

    fn grant(&self, layer: &Layer, to: &Address, credits: u64) {
        let _ = layer.down(Event::Message(
            self.control(to, FlowHeader::Replenish { credits }),
        ));
    }

    fn handle_credit_request(&self, layer: &Layer, from: &Address) {
        let credits = lock(&self.received)
            .get_mut(from)
            .map(std::mem::take)
            .unwrap_or(0);
        if credits > 0 {
            self.grant(layer, from, credits);
        }
    }

    /// Handle an inbound message. Returns it if it belongs further up.
    fn receive(&self, layer: &Layer, msg: Message) -> Option<Message> {
        if let Some(Header::Flow(h)) = msg.header(self.id) {
            let h = *h;
            if let Some(from) = msg.src().cloned() {
                match h {
                    FlowHeader::Replenish { credits } => {
                        self.handle_replenish(layer, &from, credits)
                    }
                    FlowHeader::CreditRequest { .. } => self.handle_credit_request(layer, &from),
                }
            }
            return None;
        }
        if let Some((to, credits)) = self.account(layer, &msg) {
            self.grant(layer, &to, credits);
        }
        Some(msg)
    }

    fn handle_view_change(&self, layer: &Layer, view: &View) {
        let local = layer.local_address();
        lock(&self.received).retain(|a, _| view.contains(a));
        let released = match self.mode {
            FlowMode::Multicast => {
                let map = self.multicast.map();
                let mut released = Vec::new();
                for gone in map.members().iter().filter(|a| !view.contains(a)) {
                    released.extend(self.multicast.remove(gone));
                }
                for member in view.members().iter().filter(|a| *a != local) {
                    map.put_if_absent(member);
                }
                released
            }
            FlowMode::Unicast => {
                let gone: Vec<Arc<Credits>> = {
                    let mut unicast = write(&self.unicast);
                    let departed: Vec<Address> = unicast
                        .keys()
                        .filter(|a| !view.contains(a))
                        .cloned()
                        .collect();
                    departed
                        .iter()
                        .filter_map(|a| unicast.remove(a))
                        .collect()
                };
                // Senders blocked on a departed member give up.
                for credits in gone {
                    credits.reset();
                }
                Vec::new()
            }
        };
        for msg in released {
            let _ = layer.down(Event::Message(msg));
        }
    }

    fn mode_name(&self) -> &'static str {
        match self.mode {
            FlowMode::Multicast => "multicast",
            FlowMode::Unicast => "unicast",
        }
    }
}

impl Protocol for FlowControl {
    fn name(&self) -> &'static str {
        match self.inner.mode {
            FlowMode::Multicast => "MFC",
            FlowMode::Unicast => "UFC",
        }
    }

    fn id(&self) -> Option<ProtocolId> {
        Some(self.inner.id)
    }

    fn init(&self, layer: Layer) -> StackResult<()> {
        let _ = self.inner.layer.set(layer);
        Ok(())
    }

    fn start(&self) -> StackResult<()> {
        self.inner.running.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.multicast.reset();
        for credits in read(&self.inner.unicast).values() {
            credits.reset();
        }
    }

    fn down(&self, evt: Event) -> StackResult<()> {
        let layer = self.inner.layer()?;
        match evt {
            Event::Message(msg) if self.inner.subject_to_credits(&msg) => {
                self.inner.send(layer, msg)
            }
            Event::ViewChange(view) => {
                self.inner.handle_view_change(layer, &view);
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
            Event::Message(msg) => {
                if let Some(msg) = self.inner.receive(layer, msg) {
                    layer.up(Event::Message(msg));
                }
            }
            Event::Batch(batch) => {
                let remaining: Vec<Message> = batch
                    .iter()
                    .cloned()
                    .filter_map(|m| self.inner.receive(layer, m))
                    .collect();
                if !remaining.is_empty() {
                    layer.up(Event::Batch(batch.with_messages(remaining)));
                }
            }
            Event::ViewChange(view) => {
                self.inner.handle_view_change(layer, &view);
                layer.up(Event::ViewChange(view));
            }
            evt => layer.up(evt),
        }
    }
}

impl std::fmt::Debug for FlowControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowControl")
            .field("mode", &self.inner.mode)
            .finish()
    }
}
