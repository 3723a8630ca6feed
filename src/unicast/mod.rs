//! Reliable unicast (UNICAST)
//!
//! Point-to-point messages are numbered per connection and acknowledged
//! cumulatively by the receiver. A connection is one direction of a peer
//! pair: the sender chooses its id, opens it with `Connect` and numbers
//! from 1. Receivers request gaps through a retransmitter; a periodic sweep
//! on the sender re-sends the newest unacknowledged message when acks stall.
//!
//! A receiver that sees data for a connection it does not know answers with
//! `Close`, and the sender reopens under a new id, renumbering whatever was
//! still unacknowledged. `Close` says which direction it refers to.
//!
//! Idle connections expire. A receiver keeps the id and highest delivered
//! seqno of its last expired connection per peer, so late copies are acked
//! rather than delivered again, and new data on it carries on in order.

mod connection;
mod protocol;

pub use connection::ConnectionState;
pub use protocol::Unicast;
