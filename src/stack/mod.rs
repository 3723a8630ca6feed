//! Channel and protocol stack
//!
//! A `Channel` is the application's handle on a group. Connecting builds a
//! fresh stack, bottom first:
//!
//! | Layer     | Role                                          |
//! |-----------|-----------------------------------------------|
//! | TRANSPORT | framing, bundling, loopback                   |
//! | NAKACK    | reliable, ordered multicast                   |
//! | UNICAST   | reliable, ordered point-to-point              |
//! | GMS       | joins, leaves, views, merges                  |
//! | MFC / UFC | multicast and unicast credits                 |
//! | FRAG      | fragmentation of large payloads               |
//!
//! Events travel through `Layer` handles; configuration is a single
//! `StackConfig` loaded from JSON and validated before use.

mod channel;
mod config;
mod discovery;
mod errors;
mod event;
mod network;
mod protocol;
mod stack;
mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{Channel, ChannelState};
pub use config::{
    BundlerKind, FlowConfig, FragConfig, GmsConfig, IntervalConfig, NakackConfig, PolicyKind,
    StackConfig, TransportConfig, UnicastConfig,
};
pub use discovery::{Discovery, PingData};
pub use errors::{StackError, StackResult, TransportError, TransportResult};
pub use event::Event;
pub use network::{InMemoryNetwork, InMemoryTransport, MessageFilter};
pub use protocol::{Layer, Protocol, Receiver};
pub use stack::ProtocolStack;
pub use transport::{Transport, TransportHandler, TransportProtocol};
