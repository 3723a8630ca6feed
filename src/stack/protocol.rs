//! Protocol layers
//!
//! A stack is an ordered list of protocols, bottom (transport) first. Each
//! protocol receives a `Layer` handle at init time and uses it to pass events
//! to its neighbours:
//! - `Layer::down` hands an event to the protocol below
//! - `Layer::up` hands an event to the protocol above, or to the
//!   application receiver at the top
//!
//! Protocols must not hold their own locks while calling `down` or `up`:
//! loopback and local delivery may re-enter the stack on the same thread.

use std::sync::{Arc, RwLock, Weak};

use super::errors::{StackError, StackResult};
use super::event::Event;
use crate::address::Address;
use crate::message::{Message, ProtocolId};
use crate::observability::MetricsRegistry;
use crate::sync::read;
use crate::timer::Scheduler;
use crate::view::View;

/// Application callbacks at the top of the stack.
pub trait Receiver: Send + Sync {
    /// A message was delivered.
    fn receive(&self, msg: Message);

    /// A new view was installed.
    fn view_accepted(&self, _view: &View) {}
}

/// One stage of the stack.
pub trait Protocol: Send + Sync {
    fn name(&self) -> &'static str;

    /// Header id owned by this protocol, if it puts headers on messages.
    fn id(&self) -> Option<ProtocolId> {
        None
    }

    /// Called once, bottom-up, when the stack is assembled.
    fn init(&self, layer: Layer) -> StackResult<()>;

    /// Called bottom-up when the channel connects.
    fn start(&self) -> StackResult<()> {
        Ok(())
    }

    /// Called top-down when the channel disconnects. Must be idempotent.
    fn stop(&self) {}

    /// Handle an event travelling towards the network.
    fn down(&self, evt: Event) -> StackResult<()>;

    /// Handle an event travelling towards the application.
    fn up(&self, evt: Event);
}

pub(crate) struct StackInner {
    pub(crate) protocols: Vec<Arc<dyn Protocol>>,
    pub(crate) receiver: RwLock<Option<Arc<dyn Receiver>>>,
}

/// A protocol's handle on the stack it lives in.
#[derive(Clone)]
pub struct Layer {
    local: Address,
    scheduler: Arc<dyn Scheduler>,
    metrics: Arc<MetricsRegistry>,
    stack: Weak<StackInner>,
    index: usize,
}

impl Layer {
    pub(crate) fn new(
        local: Address,
        scheduler: Arc<dyn Scheduler>,
        metrics: Arc<MetricsRegistry>,
        stack: Weak<StackInner>,
        index: usize,
    ) -> Self {
        Self {
            local,
            scheduler,
            metrics,
            stack,
            index,
        }
    }

    /// Address of the local member.
    pub fn local_address(&self) -> &Address {
        &self.local
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Position in the stack, 0 being the transport.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Pass `evt` to the protocol below.
    pub fn down(&self, evt: Event) -> StackResult<()> {
        let stack = self.stack.upgrade().ok_or(StackError::Closed)?;
        if self.index == 0 {
            return Err(StackError::Internal(format!(
                "no protocol below the bottom layer for {}",
                evt.name()
            )));
        }
        let below = Arc::clone(&stack.protocols[self.index - 1]);
        drop(stack);
        below.down(evt)
    }

    /// Pass `evt` to the protocol above, or to the receiver at the top.
    pub fn up(&self, evt: Event) {
        let Some(stack) = self.stack.upgrade() else {
            return;
        };
        if let Some(above) = stack.protocols.get(self.index + 1).cloned() {
            drop(stack);
            above.up(evt);
            return;
        }
        let receiver = read(&stack.receiver).clone();
        drop(stack);
        if let Some(receiver) = receiver {
            deliver(&receiver, &self.metrics, evt);
        }
    }
}

fn deliver(receiver: &Arc<dyn Receiver>, metrics: &MetricsRegistry, evt: Event) {
    match evt {
        Event::Message(msg) => {
            metrics.increment_messages_delivered();
            receiver.receive(msg);
        }
        Event::Batch(batch) => {
            metrics.add_messages_delivered(batch.len() as u64);
            for msg in batch {
                receiver.receive(msg);
            }
        }
        Event::ViewChange(view) => receiver.view_accepted(&view),
        _ => {}
    }
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("local", &self.local)
            .field("index", &self.index)
            .finish()
    }
}
