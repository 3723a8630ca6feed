//! In-crate test harness: a stack whose bottom layer records what is sent
//! and lets tests inject inbound events.

use std::sync::{Arc, Mutex, OnceLock};

use super::errors::StackResult;
use super::event::Event;
use super::protocol::{Layer, Protocol, Receiver};
use super::stack::ProtocolStack;
use crate::address::Address;
use crate::message::{Header, Message, ProtocolId};
use crate::observability::MetricsRegistry;
use crate::sync::lock;
use crate::timer::ManualScheduler;
use crate::view::View;

/// Bottom protocol standing in for the transport.
#[derive(Default)]
pub(crate) struct Wire {
    layer: OnceLock<Layer>,
    sent: Mutex<Vec<Message>>,
    events: Mutex<Vec<Event>>,
}

impl Wire {
    /// Pass `evt` up from the bottom of the stack.
    pub(crate) fn inject(&self, evt: Event) {
        if let Some(layer) = self.layer.get() {
            layer.up(evt);
        }
    }

    /// Deliver `msg` as if `from` had sent it.
    pub(crate) fn receive(&self, from: &Address, mut msg: Message) {
        msg.set_src(from.clone());
        self.inject(Event::Message(msg));
    }

    pub(crate) fn take(&self) -> Vec<Message> {
        std::mem::take(&mut *lock(&self.sent))
    }

    pub(crate) fn sent(&self) -> Vec<Message> {
        lock(&self.sent).clone()
    }

    /// Sent messages carrying a header of protocol `id`.
    pub(crate) fn sent_with(&self, id: ProtocolId) -> Vec<(Message, Header)> {
        lock(&self.sent)
            .iter()
            .filter_map(|m| m.header(id).map(|h| (m.clone(), h.clone())))
            .collect()
    }

    pub(crate) fn events(&self) -> Vec<String> {
        lock(&self.events).iter().map(|e| e.name().to_string()).collect()
    }
}

impl Protocol for Wire {
    fn name(&self) -> &'static str {
        "WIRE"
    }

    fn init(&self, layer: Layer) -> StackResult<()> {
        let _ = self.layer.set(layer);
        Ok(())
    }

    fn down(&self, evt: Event) -> StackResult<()> {
        match evt {
            Event::Message(mut msg) => {
                if msg.src().is_none() {
                    if let Some(layer) = self.layer.get() {
                        msg.set_src(layer.local_address().clone());
                    }
                }
                lock(&self.sent).push(msg);
            }
            evt => lock(&self.events).push(evt),
        }
        Ok(())
    }

    fn up(&self, evt: Event) {
        self.inject(evt);
    }
}

/// Application receiver recording deliveries.
#[derive(Default)]
pub(crate) struct Collect {
    pub(crate) messages: Mutex<Vec<Message>>,
    pub(crate) views: Mutex<Vec<View>>,
}

impl Collect {
    pub(crate) fn payloads(&self) -> Vec<String> {
        lock(&self.messages)
            .iter()
            .map(|m| String::from_utf8_lossy(m.payload()).into_owned())
            .collect()
    }
}

impl Receiver for Collect {
    fn receive(&self, msg: Message) {
        lock(&self.messages).push(msg);
    }

    fn view_accepted(&self, view: &View) {
        lock(&self.views).push(view.clone());
    }
}

pub(crate) struct Harness {
    pub(crate) stack: ProtocolStack,
    pub(crate) wire: Arc<Wire>,
    pub(crate) app: Arc<Collect>,
    pub(crate) scheduler: Arc<ManualScheduler>,
}

impl Harness {
    pub(crate) fn send(&self, msg: Message) -> StackResult<()> {
        self.stack.down(Event::Message(msg))
    }
}

/// Assemble and start `protocols` on top of a `Wire`.
pub(crate) fn harness(local: Address, protocols: Vec<Arc<dyn Protocol>>) -> Harness {
    let wire = Arc::new(Wire::default());
    let scheduler = Arc::new(ManualScheduler::new());
    let mut all: Vec<Arc<dyn Protocol>> = vec![wire.clone()];
    all.extend(protocols);
    let stack = ProtocolStack::new(
        local,
        scheduler.clone(),
        Arc::new(MetricsRegistry::new()),
        all,
    )
    .unwrap();
    let app = Arc::new(Collect::default());
    stack.set_receiver(Some(app.clone()));
    stack.start().unwrap();
    Harness {
        stack,
        wire,
        app,
        scheduler,
    }
}

pub(crate) fn addr(n: u128) -> Address {
    Address::from_u128(n)
}
