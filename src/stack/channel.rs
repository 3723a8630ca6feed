//! Channel: the application handle on a group
//!
//! A channel owns its configuration, transport, discovery and scheduler, and
//! assembles a fresh protocol stack on every `connect`:
//!
//! ```text
//! FRAG
//! UFC
//! MFC
//! GMS
//! UNICAST
//! NAKACK
//! TRANSPORT
//! ```
//!
//! Lifecycle: `Open -> Connecting -> Connected -> Open -> ... -> Closed`.
//! A failed connect leaves the channel `Open`; a closed channel cannot be
//! reused.

use std::sync::{Arc, Mutex, RwLock};

use super::config::StackConfig;
use super::discovery::Discovery;
use super::errors::{StackError, StackResult};
use super::event::Event;
use super::protocol::{Protocol, Receiver};
use super::stack::ProtocolStack;
use super::transport::{Transport, TransportProtocol};
use crate::address::Address;
use crate::flow::{FlowControl, FlowMode};
use crate::frag::Frag;
use crate::gms::Gms;
use crate::message::{HeaderRegistry, Message};
use crate::nakack::Nakack;
use crate::observability::{log_event_with_fields, Event as LogEvent, MetricsRegistry};
use crate::sync::{lock, read, write};
use crate::timer::{Scheduler, TokioScheduler};
use crate::unicast::Unicast;
use crate::view::View;

/// Where a channel is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Created or disconnected; `connect` may be called
    Open,
    /// A join is in progress
    Connecting,
    /// Member of a group
    Connected,
    /// Terminal
    Closed,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Open => "OPEN",
            ChannelState::Connecting => "CONNECTING",
            ChannelState::Connected => "CONNECTED",
            ChannelState::Closed => "CLOSED",
        }
    }
}

struct Connection {
    cluster: String,
    stack: ProtocolStack,
    gms: Arc<Gms>,
}

/// A member's handle on one group.
pub struct Channel {
    config: StackConfig,
    transport: Arc<dyn Transport>,
    discovery: Arc<dyn Discovery>,
    scheduler: Arc<dyn Scheduler>,
    registry: Arc<HeaderRegistry>,
    metrics: Arc<MetricsRegistry>,
    state: RwLock<ChannelState>,
    connection: RwLock<Option<Arc<Connection>>>,
    receiver: RwLock<Option<Arc<dyn Receiver>>>,
    /// Serializes connect, disconnect and close
    lifecycle: Mutex<()>,
}

impl Channel {
    /// Create a channel over `transport`. The configuration is validated here
    /// so that a bad document fails before any network activity.
    pub fn new(
        config: StackConfig,
        transport: Arc<dyn Transport>,
        discovery: Arc<dyn Discovery>,
        scheduler: Arc<dyn Scheduler>,
    ) -> StackResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            transport,
            discovery,
            scheduler,
            registry: Arc::new(HeaderRegistry::with_defaults()),
            metrics: Arc::new(MetricsRegistry::new()),
            state: RwLock::new(ChannelState::Open),
            connection: RwLock::new(None),
            receiver: RwLock::new(None),
            lifecycle: Mutex::new(()),
        })
    }

    /// Create a channel with its own tokio-backed scheduler of
    /// `config.timer_threads` workers.
    pub fn with_runtime(
        config: StackConfig,
        transport: Arc<dyn Transport>,
        discovery: Arc<dyn Discovery>,
    ) -> StackResult<Self> {
        let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::new(config.timer_threads)?);
        Self::new(config, transport, discovery, scheduler)
    }

    pub fn local_address(&self) -> &Address {
        self.transport.local_address()
    }

    pub fn state(&self) -> ChannelState {
        *read(&self.state)
    }

    /// Counters of this channel, accumulated across reconnects.
    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// The installed view, `None` unless connected.
    pub fn get_view(&self) -> Option<View> {
        read(&self.connection).as_ref().and_then(|c| c.gms.view())
    }

    /// Name of the group this channel is connected to.
    pub fn cluster(&self) -> Option<String> {
        read(&self.connection).as_ref().map(|c| c.cluster.clone())
    }

    /// Install the application callbacks. Takes effect immediately on a
    /// connected channel and survives reconnects.
    pub fn set_receiver(&self, receiver: Option<Arc<dyn Receiver>>) {
        *write(&self.receiver) = receiver.clone();
        if let Some(conn) = read(&self.connection).as_ref() {
            conn.stack.set_receiver(receiver);
        }
    }

    /// Join `cluster`. Blocks until a view is installed or joining fails.
    pub fn connect(&self, cluster: &str) -> StackResult<()> {
        let _guard = lock(&self.lifecycle);
        match self.state() {
            ChannelState::Open => {}
            ChannelState::Closed => return Err(StackError::Closed),
            other => {
                return Err(StackError::invalid_state(format!(
                    "connect on a {} channel",
                    other.as_str()
                )))
            }
        }

        let local = self.local_address().to_string();
        log_event_with_fields(
            LogEvent::ChannelConnecting,
            &[("cluster", cluster), ("local", &local)],
        );
        *write(&self.state) = ChannelState::Connecting;

        let conn = match self.build(cluster) {
            Ok(conn) => conn,
            Err(e) => {
                *write(&self.state) = ChannelState::Open;
                return Err(e);
            }
        };
        // Published before the join so that views delivered during it reach
        // `get_view` callers and the receiver.
        *write(&self.connection) = Some(Arc::clone(&conn));

        let joined = conn
            .stack
            .start()
            .and_then(|()| conn.stack.down(Event::Connect(cluster.to_string())));
        if let Err(e) = joined {
            conn.stack.stop();
            *write(&self.connection) = None;
            *write(&self.state) = ChannelState::Open;
            let reason = e.to_string();
            log_event_with_fields(
                LogEvent::ChannelDisconnected,
                &[("cluster", cluster), ("local", &local), ("reason", &reason)],
            );
            return Err(e);
        }

        *write(&self.state) = ChannelState::Connected;
        let view = conn.gms.view().map(|v| v.to_string()).unwrap_or_default();
        log_event_with_fields(
            LogEvent::ChannelConnected,
            &[("cluster", cluster), ("local", &local), ("view", &view)],
        );
        Ok(())
    }

    /// Leave the group. The channel can be connected again afterwards.
    /// Does nothing unless connected.
    pub fn disconnect(&self) {
        let _guard = lock(&self.lifecycle);
        self.disconnect_locked();
    }

    fn disconnect_locked(&self) {
        if self.state() != ChannelState::Connected {
            return;
        }
        let Some(conn) = write(&self.connection).take() else {
            *write(&self.state) = ChannelState::Open;
            return;
        };
        if let Err(e) = conn.stack.down(Event::Disconnect) {
            let reason = e.to_string();
            log_event_with_fields(LogEvent::ChannelDisconnected, &[("reason", &reason)]);
        }
        conn.stack.stop();
        *write(&self.state) = ChannelState::Open;
        let local = self.local_address().to_string();
        log_event_with_fields(
            LogEvent::ChannelDisconnected,
            &[("cluster", &conn.cluster), ("local", &local)],
        );
    }

    /// Disconnect if needed and release the channel for good.
    pub fn close(&self) {
        let _guard = lock(&self.lifecycle);
        if self.state() == ChannelState::Closed {
            return;
        }
        self.disconnect_locked();
        *write(&self.state) = ChannelState::Closed;
        let local = self.local_address().to_string();
        log_event_with_fields(LogEvent::ChannelClosed, &[("local", &local)]);
    }

    /// Send `msg` to its destination, or to the whole group when it has none.
    pub fn send(&self, msg: Message) -> StackResult<()> {
        let conn = match self.state() {
            ChannelState::Connected => read(&self.connection).clone(),
            ChannelState::Closed => return Err(StackError::Closed),
            _ => None,
        };
        let conn = conn.ok_or(StackError::NotConnected)?;
        conn.stack.down(Event::Message(msg))
    }

    /// Assemble and initialize a new stack for `cluster`.
    fn build(&self, cluster: &str) -> StackResult<Arc<Connection>> {
        let config = &self.config;
        let nakack = Arc::new(Nakack::new(config.nakack.clone())?);
        let gms = Arc::new(Gms::new(
            config.gms.clone(),
            Arc::clone(&nakack),
            Arc::clone(&self.discovery),
        )?);
        let protocols: Vec<Arc<dyn Protocol>> = vec![
            Arc::new(TransportProtocol::new(
                Arc::clone(&self.transport),
                Arc::clone(&self.registry),
                &config.transport,
            )?),
            nakack,
            Arc::new(Unicast::new(config.unicast.clone())?),
            gms.clone(),
            Arc::new(FlowControl::new(
                FlowMode::Multicast,
                config.multicast_flow.clone(),
            )?),
            Arc::new(FlowControl::new(
                FlowMode::Unicast,
                config.unicast_flow.clone(),
            )?),
            Arc::new(Frag::new(config.frag.clone())?),
        ];
        let stack = ProtocolStack::new(
            self.local_address().clone(),
            Arc::clone(&self.scheduler),
            Arc::clone(&self.metrics),
            protocols,
        )?;
        stack.set_receiver(read(&self.receiver).clone());
        Ok(Arc::new(Connection {
            cluster: cluster.to_string(),
            stack,
            gms,
        }))
    }

    /// Protocol names of the current stack, bottom first.
    pub fn protocol_names(&self) -> Vec<&'static str> {
        read(&self.connection)
            .as_ref()
            .map(|c| c.stack.names())
            .unwrap_or_default()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::stack::InMemoryNetwork;
    use crate::sync::wait_until;

    const WAIT: Duration = Duration::from_secs(5);
    const POLL: Duration = Duration::from_millis(10);

    struct Collect {
        received: Mutex<Vec<Bytes>>,
    }

    impl Receiver for Collect {
        fn receive(&self, msg: Message) {
            lock(&self.received).push(msg.payload().clone());
        }
    }

    fn fast_config() -> StackConfig {
        let mut config = StackConfig::default();
        config.gms.join_timeout_ms = 200;
        config.gms.max_join_attempts = 2;
        config.gms.merge_min_interval_ms = 0;
        config.gms.merge_max_interval_ms = 0;
        config
    }

    fn channel(net: &InMemoryNetwork, n: u128) -> Channel {
        let transport = net.endpoint(Address::from_u128(n));
        match Channel::with_runtime(fast_config(), transport, net.discovery()) {
            Ok(ch) => ch,
            Err(e) => panic!("channel: {e}"),
        }
    }

    #[test]
    fn test_lifecycle_states() {
        let net = InMemoryNetwork::new();
        let ch = channel(&net, 1);
        assert_eq!(ch.state(), ChannelState::Open);
        assert!(ch.get_view().is_none());

        ch.connect("lifecycle").unwrap();
        assert_eq!(ch.state(), ChannelState::Connected);
        assert_eq!(ch.cluster().as_deref(), Some("lifecycle"));
        assert_eq!(
            ch.protocol_names(),
            vec!["TRANSPORT", "NAKACK", "UNICAST", "GMS", "MFC", "UFC", "FRAG"]
        );
        let view = ch.get_view().unwrap();
        assert_eq!(view.members(), &[ch.local_address().clone()]);

        ch.disconnect();
        assert_eq!(ch.state(), ChannelState::Open);
        assert!(ch.get_view().is_none());

        ch.connect("lifecycle").unwrap();
        ch.close();
        assert_eq!(ch.state(), ChannelState::Closed);
        assert!(matches!(ch.connect("lifecycle"), Err(StackError::Closed)));
    }

    #[test]
    fn test_send_requires_connection() {
        let net = InMemoryNetwork::new();
        let ch = channel(&net, 1);
        let msg = Message::new(None, Bytes::from_static(b"x"));
        assert!(matches!(ch.send(msg.clone()), Err(StackError::NotConnected)));
        ch.close();
        assert!(matches!(ch.send(msg), Err(StackError::Closed)));
    }

    #[test]
    fn test_connect_twice_is_invalid() {
        let net = InMemoryNetwork::new();
        let ch = channel(&net, 1);
        ch.connect("twice").unwrap();
        assert!(matches!(
            ch.connect("twice"),
            Err(StackError::InvalidState(_))
        ));
    }

    #[test]
    fn test_multicast_reaches_both_members() {
        let net = InMemoryNetwork::new();
        let a = channel(&net, 1);
        let b = channel(&net, 2);
        let ra = Arc::new(Collect {
            received: Mutex::new(Vec::new()),
        });
        let rb = Arc::new(Collect {
            received: Mutex::new(Vec::new()),
        });
        a.set_receiver(Some(ra.clone()));
        b.set_receiver(Some(rb.clone()));

        a.connect("pair").unwrap();
        b.connect("pair").unwrap();
        assert!(wait_until(WAIT, POLL, || {
            a.get_view().map(|v| v.size()) == Some(2)
        }));

        a.send(Message::new(None, Bytes::from_static(b"hello")))
            .unwrap();
        assert!(wait_until(WAIT, POLL, || {
            lock(&ra.received).len() == 1 && lock(&rb.received).len() == 1
        }));
        assert_eq!(lock(&rb.received)[0], Bytes::from_static(b"hello"));
        assert!(a.metrics().snapshot().messages_sent >= 1);
    }
}
