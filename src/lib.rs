//! aerocast - reliable group communication
//!
//! A protocol stack that turns an unreliable datagram transport into a
//! process group with:
//! - reliable, per-sender FIFO multicast (`nakack`)
//! - reliable, FIFO unicast with connection lifecycle (`unicast`)
//! - membership views with join, leave, failure handling and partition
//!   merging (`gms`)
//! - credit-based flow control (`flow`)
//! - fragmentation of large messages (`frag`)
//!
//! Applications use `stack::Channel`; everything below it is a `Protocol`
//! in a `ProtocolStack`.

pub mod address;
pub mod bundler;
pub mod cli;
pub mod flow;
pub mod frag;
pub mod gms;
pub mod message;
pub mod nakack;
pub mod observability;
pub mod retransmit;
pub mod stack;
pub mod sync;
pub mod timer;
pub mod unicast;
pub mod view;
pub mod window;
