//! Transport boundary
//!
//! The byte-moving `Transport` is an external collaborator; the stack only
//! needs unicast and multicast sends plus an inbound callback. The
//! `TransportProtocol` is the bottom of every stack:
//! - outbound: stamps a missing source address, loops local copies back up,
//!   hands everything else to the bundler
//! - inbound: decodes frames, drops traffic for other clusters, passes a
//!   single message or a batch up
//! - a send failure that closes the peer's connection travels up as
//!   `Event::ConnectionReset`

use std::sync::{Arc, OnceLock, RwLock};

use bytes::Bytes;

use super::config::TransportConfig;
use super::errors::{StackResult, TransportResult};
use super::event::Event;
use super::protocol::{Layer, Protocol};
use crate::address::Address;
use crate::bundler::{new_bundler, BundleSink, Bundler};
use crate::message::{
    decode_frame, encode_frame, HeaderRegistry, Message, MessageBatch, TransientFlags,
};
use crate::observability::{log_event_with_fields, Event as LogEvent, Logger, Severity};
use crate::sync::{read, write};

/// Moves frames between members.
pub trait Transport: Send + Sync {
    fn local_address(&self) -> &Address;

    /// Begin delivering inbound frames to `handler`.
    fn start(&self, handler: Arc<dyn TransportHandler>) -> TransportResult<()>;

    fn send_unicast(&self, dest: &Address, data: Bytes) -> TransportResult<()>;

    /// Send to every other member reachable on the group channel.
    fn send_multicast(&self, data: Bytes) -> TransportResult<()>;

    /// Stop delivering and release the handler. Idempotent.
    fn stop(&self);
}

/// Inbound side of a transport.
pub trait TransportHandler: Send + Sync {
    fn receive(&self, sender: &Address, data: Bytes);

    /// The failure detector suspects `member`.
    fn suspect(&self, member: &Address);
}

struct TransportShared {
    transport: Arc<dyn Transport>,
    registry: Arc<HeaderRegistry>,
    cluster: RwLock<String>,
    layer: OnceLock<Layer>,
}

impl TransportShared {
    fn up(&self, evt: Event) {
        if let Some(layer) = self.layer.get() {
            layer.up(evt);
        }
    }
}

impl BundleSink for TransportShared {
    fn write(&self, dest: Option<&Address>, messages: &[Message]) {
        let frame = encode_frame(&read(&self.cluster), dest.is_none(), messages);
        let len = frame.len() as u64;
        let result = match dest {
            Some(dest) => self.transport.send_unicast(dest, frame),
            None => self.transport.send_multicast(frame),
        };
        match result {
            Ok(()) => {
                if let Some(layer) = self.layer.get() {
                    layer.metrics().increment_batches_sent();
                    layer.metrics().add_bytes_sent(len);
                }
            }
            Err(e) => {
                if Logger::enabled(Severity::Trace) {
                    Logger::trace(
                        "SEND_FAILED",
                        &[
                            ("dest", &dest.map(|d| d.to_string()).unwrap_or_default()),
                            ("error", &e.to_string()),
                        ],
                    );
                }
                if let (Some(dest), true) = (dest, e.closes_connection()) {
                    self.up(Event::ConnectionReset(dest.clone()));
                }
            }
        }
    }
}

impl TransportHandler for TransportShared {
    fn receive(&self, sender: &Address, data: Bytes) {
        let frame = match decode_frame(&data, &self.registry) {
            Ok(frame) => frame,
            Err(e) => {
                log_event_with_fields(
                    LogEvent::FrameDropped,
                    &[("sender", &sender.to_string()), ("error", &e.to_string())],
                );
                return;
            }
        };
        if frame.cluster != *read(&self.cluster) || frame.messages.is_empty() {
            return;
        }
        let Some(layer) = self.layer.get() else {
            return;
        };
        layer
            .metrics()
            .add_messages_received(frame.messages.len() as u64);

        let mut messages = frame.messages;
        for msg in &mut messages {
            if msg.src().is_none() {
                msg.set_src(sender.clone());
            }
        }
        if messages.len() == 1 {
            if let Some(msg) = messages.pop() {
                layer.up(Event::Message(msg));
            }
            return;
        }
        let dest = if frame.multicast {
            None
        } else {
            messages[0].dest().cloned()
        };
        layer.up(Event::Batch(MessageBatch::new(
            dest,
            sender.clone(),
            frame.cluster,
            frame.multicast,
            messages,
        )));
    }

    fn suspect(&self, member: &Address) {
        self.up(Event::Suspect(member.clone()));
    }
}

/// Bottom protocol: bundling, framing and loopback.
pub struct TransportProtocol {
    shared: Arc<TransportShared>,
    bundler: Arc<dyn Bundler>,
}

impl TransportProtocol {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<HeaderRegistry>,
        config: &TransportConfig,
    ) -> StackResult<Self> {
        let shared = Arc::new(TransportShared {
            transport,
            registry,
            cluster: RwLock::new(String::new()),
            layer: OnceLock::new(),
        });
        let sink: Arc<dyn BundleSink> = shared.clone();
        let bundler = new_bundler(config, sink)?;
        Ok(Self { shared, bundler })
    }

    pub fn cluster(&self) -> String {
        read(&self.shared.cluster).clone()
    }

    pub fn bundler(&self) -> &Arc<dyn Bundler> {
        &self.bundler
    }
}

impl Protocol for TransportProtocol {
    fn name(&self) -> &'static str {
        "TRANSPORT"
    }

    fn init(&self, layer: Layer) -> StackResult<()> {
        let _ = self.shared.layer.set(layer);
        Ok(())
    }

    fn start(&self) -> StackResult<()> {
        self.bundler.start();
        let handler: Arc<dyn TransportHandler> = self.shared.clone();
        self.shared.transport.start(handler)?;
        Ok(())
    }

    fn stop(&self) {
        self.bundler.stop();
        self.shared.transport.stop();
    }

    fn down(&self, evt: Event) -> StackResult<()> {
        let Some(layer) = self.shared.layer.get() else {
            return Ok(());
        };
        match evt {
            Event::Message(mut msg) => {
                let local = layer.local_address();
                // Retransmissions keep the original sender as source.
                if msg.src().is_none() {
                    msg.set_src(local.clone());
                }
                layer.metrics().increment_messages_sent();
                if msg.dest() == Some(local) {
                    layer.up(Event::Message(msg));
                    return Ok(());
                }
                if msg.is_multicast() && !msg.is_transient_flag_set(TransientFlags::DONT_LOOPBACK) {
                    layer.up(Event::Message(msg.clone()));
                }
                self.bundler.send(msg);
                Ok(())
            }
            Event::Connect(cluster) => {
                *write(&self.shared.cluster) = cluster;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn up(&self, evt: Event) {
        if let Some(layer) = self.shared.layer.get() {
            layer.up(evt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Flags, Header, NakackHeader, ProtocolId};
    use crate::observability::MetricsRegistry;
    use crate::stack::{ProtocolStack, Receiver};
    use crate::sync::lock;
    use crate::timer::ManualScheduler;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Loop {
        sent: Mutex<Vec<(Option<Address>, Bytes)>>,
        handler: Mutex<Option<Arc<dyn TransportHandler>>>,
    }

    impl Transport for Loop {
        fn local_address(&self) -> &Address {
            unreachable!("not used by the protocol")
        }

        fn start(&self, handler: Arc<dyn TransportHandler>) -> TransportResult<()> {
            *lock(&self.handler) = Some(handler);
            Ok(())
        }

        fn send_unicast(&self, dest: &Address, data: Bytes) -> TransportResult<()> {
            lock(&self.sent).push((Some(dest.clone()), data));
            Ok(())
        }

        fn send_multicast(&self, data: Bytes) -> TransportResult<()> {
            lock(&self.sent).push((None, data));
            Ok(())
        }

        fn stop(&self) {
            lock(&self.handler).take();
        }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<Message>>);

    impl Receiver for Collect {
        fn receive(&self, msg: Message) {
            lock(&self.0).push(msg);
        }
    }

    fn setup() -> (Arc<Loop>, ProtocolStack, Arc<Collect>) {
        let net = Arc::new(Loop::default());
        let proto = TransportProtocol::new(
            net.clone(),
            Arc::new(HeaderRegistry::with_defaults()),
            &TransportConfig::default(),
        )
        .unwrap();
        let stack = ProtocolStack::new(
            Address::from_u128(1),
            Arc::new(ManualScheduler::new()),
            Arc::new(MetricsRegistry::new()),
            vec![Arc::new(proto)],
        )
        .unwrap();
        let collect = Arc::new(Collect::default());
        stack.set_receiver(Some(collect.clone()));
        stack.down(Event::Connect("demo".into())).unwrap();
        stack.start().unwrap();
        (net, stack, collect)
    }

    #[test]
    fn test_multicast_loops_back_unless_flagged() {
        let (net, stack, collect) = setup();
        stack.down(Event::Message(Message::new(None, &b"a"[..]))).unwrap();
        stack
            .down(Event::Message(
                Message::new(None, &b"b"[..]).with_transient_flags(TransientFlags::DONT_LOOPBACK),
            ))
            .unwrap();
        assert_eq!(lock(&collect.0).len(), 1);
        assert_eq!(lock(&net.sent).len(), 2);
        assert_eq!(lock(&collect.0)[0].src(), Some(&Address::from_u128(1)));
    }

    #[test]
    fn test_unicast_to_self_skips_the_wire() {
        let (net, stack, collect) = setup();
        let me = Address::from_u128(1);
        stack.down(Event::Message(Message::new(Some(me), &b"x"[..]))).unwrap();
        assert_eq!(lock(&collect.0).len(), 1);
        assert!(lock(&net.sent).is_empty());
    }

    #[test]
    fn test_inbound_frames_filtered_by_cluster() {
        let (net, stack, collect) = setup();
        let handler = lock(&net.handler).clone().unwrap();
        let peer = Address::from_u128(2);
        let mut msg = Message::new(None, &b"hi"[..]).with_flags(Flags::OOB);
        msg.put_header(ProtocolId::NAKACK, Header::Nakack(NakackHeader::Msg { seqno: 1 }));

        handler.receive(&peer, encode_frame("other", true, &[msg.clone()]));
        assert!(lock(&collect.0).is_empty());

        handler.receive(&peer, encode_frame("demo", true, &[msg.clone(), msg]));
        let got = lock(&collect.0);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].src(), Some(&peer));
        assert_eq!(stack.metrics().snapshot().messages_received, 2);
    }

    #[test]
    fn test_garbage_frame_is_dropped() {
        let (net, _stack, collect) = setup();
        let handler = lock(&net.handler).clone().unwrap();
        handler.receive(&Address::from_u128(2), Bytes::from_static(b"garbage!"));
        assert!(lock(&collect.0).is_empty());
    }
}
