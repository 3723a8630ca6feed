//! Credit-based flow control
//!
//! - `CreditMap`: per-member credits; senders block until every member has
//!   enough, or a timeout passes
//! - `NonBlockingCreditMap`: same accounting, but messages that do not fit
//!   are queued in FIFO order and released by replenishment
//! - `FlowControl`: the protocol, in multicast mode (one map over all
//!   members) or unicast mode (one map per destination)
//!
//! Receivers count bytes per sender and send a `Replenish` once the count
//! passes `max_credits * min_threshold`. A blocked sender asks the members
//! holding it back for credits.

mod credit_map;
mod non_blocking;
mod protocol;

pub use credit_map::CreditMap;
pub use non_blocking::{Admission, NonBlockingCreditMap};
pub use protocol::{FlowControl, FlowMode};
