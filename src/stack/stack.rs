//! Protocol stack pipeline
//!
//! Owns the ordered protocol list and drives its lifecycle:
//! - `new` checks header ids are unique and calls `init` bottom-up
//! - `start` runs bottom-up, `stop` top-down
//! - `down` enters the stack at the top protocol

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::errors::{StackError, StackResult};
use super::event::Event;
use super::protocol::{Layer, Protocol, Receiver, StackInner};
use crate::address::Address;
use crate::observability::MetricsRegistry;
use crate::sync::write;
use crate::timer::Scheduler;

/// An assembled, ordered list of protocols.
pub struct ProtocolStack {
    inner: Arc<StackInner>,
    local: Address,
    scheduler: Arc<dyn Scheduler>,
    metrics: Arc<MetricsRegistry>,
}

impl ProtocolStack {
    /// Assemble `protocols` (bottom first) and initialize them.
    pub fn new(
        local: Address,
        scheduler: Arc<dyn Scheduler>,
        metrics: Arc<MetricsRegistry>,
        protocols: Vec<Arc<dyn Protocol>>,
    ) -> StackResult<Self> {
        if protocols.is_empty() {
            return Err(StackError::config("a stack needs at least one protocol"));
        }

        let mut owners: HashMap<u16, &'static str> = HashMap::new();
        for p in &protocols {
            if let Some(id) = p.id() {
                if let Some(existing) = owners.insert(id.0, p.name()) {
                    return Err(StackError::DuplicateProtocol(format!(
                        "id {} claimed by {} and {}",
                        id.0,
                        existing,
                        p.name()
                    )));
                }
            }
        }

        let inner = Arc::new(StackInner {
            protocols,
            receiver: RwLock::new(None),
        });
        for (index, p) in inner.protocols.iter().enumerate() {
            p.init(Layer::new(
                local.clone(),
                Arc::clone(&scheduler),
                Arc::clone(&metrics),
                Arc::downgrade(&inner),
                index,
            ))?;
        }

        Ok(Self {
            inner,
            local,
            scheduler,
            metrics,
        })
    }

    /// Start every protocol, bottom-up. On failure, the protocols already
    /// started are stopped again.
    pub fn start(&self) -> StackResult<()> {
        for (i, p) in self.inner.protocols.iter().enumerate() {
            if let Err(e) = p.start() {
                for started in self.inner.protocols[..i].iter().rev() {
                    started.stop();
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stop every protocol, top-down.
    pub fn stop(&self) {
        for p in self.inner.protocols.iter().rev() {
            p.stop();
        }
    }

    /// Send an event down from the top of the stack.
    pub fn down(&self, evt: Event) -> StackResult<()> {
        let top = self
            .inner
            .protocols
            .last()
            .ok_or_else(|| StackError::Internal("empty stack".into()))?;
        top.down(evt)
    }

    pub fn set_receiver(&self, receiver: Option<Arc<dyn Receiver>>) {
        *write(&self.inner.receiver) = receiver;
    }

    pub fn local_address(&self) -> &Address {
        &self.local
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Protocol names, bottom first.
    pub fn names(&self) -> Vec<&'static str> {
        self.inner.protocols.iter().map(|p| p.name()).collect()
    }

    pub fn find(&self, name: &str) -> Option<&Arc<dyn Protocol>> {
        self.inner.protocols.iter().find(|p| p.name() == name)
    }
}

impl std::fmt::Debug for ProtocolStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolStack")
            .field("local", &self.local)
            .field("protocols", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, ProtocolId};
    use crate::timer::ManualScheduler;
    use std::sync::{Mutex, OnceLock};

    type Trace = Arc<Mutex<Vec<String>>>;

    /// Records every event and forwards it.
    struct Recorder {
        name: &'static str,
        id: Option<ProtocolId>,
        trace: Trace,
        layer: OnceLock<Layer>,
    }

    impl Recorder {
        fn new(name: &'static str, id: Option<ProtocolId>, trace: &Trace) -> Arc<dyn Protocol> {
            Arc::new(Self {
                name,
                id,
                trace: Arc::clone(trace),
                layer: OnceLock::new(),
            })
        }

        fn layer(&self) -> &Layer {
            self.layer.get().unwrap()
        }
    }

    impl Protocol for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn id(&self) -> Option<ProtocolId> {
            self.id
        }

        fn init(&self, layer: Layer) -> StackResult<()> {
            self.layer.set(layer).ok();
            Ok(())
        }

        fn start(&self) -> StackResult<()> {
            self.trace.lock().unwrap().push(format!("start {}", self.name));
            Ok(())
        }

        fn stop(&self) {
            self.trace.lock().unwrap().push(format!("stop {}", self.name));
        }

        fn down(&self, evt: Event) -> StackResult<()> {
            self.trace.lock().unwrap().push(format!("down {}", self.name));
            if self.layer().index() == 0 {
                // Bottom: turn it around.
                self.layer().up(evt);
                return Ok(());
            }
            self.layer().down(evt)
        }

        fn up(&self, evt: Event) {
            self.trace.lock().unwrap().push(format!("up {}", self.name));
            self.layer().up(evt);
        }
    }

    struct Collect(Mutex<Vec<Message>>);

    impl Receiver for Collect {
        fn receive(&self, msg: Message) {
            self.0.lock().unwrap().push(msg);
        }
    }

    fn stack(protocols: Vec<Arc<dyn Protocol>>) -> StackResult<ProtocolStack> {
        ProtocolStack::new(
            Address::from_u128(1),
            Arc::new(ManualScheduler::new()),
            Arc::new(MetricsRegistry::new()),
            protocols,
        )
    }

    #[test]
    fn test_events_traverse_in_order() {
        let trace: Trace = Arc::default();
        let s = stack(vec![
            Recorder::new("bottom", None, &trace),
            Recorder::new("middle", None, &trace),
            Recorder::new("top", None, &trace),
        ])
        .unwrap();
        let collect = Arc::new(Collect(Mutex::new(Vec::new())));
        s.set_receiver(Some(collect.clone()));

        s.down(Event::Message(Message::new(None, &b"x"[..]))).unwrap();

        assert_eq!(
            *trace.lock().unwrap(),
            vec![
                "down top",
                "down middle",
                "down bottom",
                "up middle",
                "up top"
            ]
        );
        assert_eq!(collect.0.lock().unwrap().len(), 1);
        assert_eq!(s.metrics().snapshot().messages_delivered, 1);
    }

    #[test]
    fn test_lifecycle_order() {
        let trace: Trace = Arc::default();
        let s = stack(vec![
            Recorder::new("a", None, &trace),
            Recorder::new("b", None, &trace),
        ])
        .unwrap();
        s.start().unwrap();
        s.stop();
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["start a", "start b", "stop b", "stop a"]
        );
        assert_eq!(s.names(), vec!["a", "b"]);
        assert!(s.find("b").is_some());
    }

    #[test]
    fn test_duplicate_protocol_id_rejected() {
        let trace: Trace = Arc::default();
        let err = stack(vec![
            Recorder::new("a", Some(ProtocolId::NAKACK), &trace),
            Recorder::new("b", Some(ProtocolId::NAKACK), &trace),
        ])
        .unwrap_err();
        assert!(matches!(err, StackError::DuplicateProtocol(_)));
    }

    #[test]
    fn test_empty_stack_rejected() {
        assert!(matches!(stack(Vec::new()), Err(StackError::Config(_))));
    }
}
