//! Sequence tracking structures
//!
//! Leaf data structures for reliable delivery, with no locking of their own;
//! owning protocols wrap them in the locks they need.
//!
//! - `Interval`: retransmission delay strategy (static list or exponential)
//! - `Range`, `Seqno`, `SeqnoRange`: seqno ranges, range keys, arrival bitmaps
//! - `AckReceiverWindow`: per-connection in-order receive window
//! - `BoundedList`: bounded FIFO cache (silent eviction)
//! - `RetransmitTable`: dense seqno -> message matrix with purgeable prefix
//! - `NakReceiverWindow`: per-sender gap-aware multicast receive window
//! - `AckTable`: per-member cumulative acks; minimum is the stable point

mod ack_table;
mod ack_window;
mod bounded_list;
mod errors;
mod interval;
mod nak_window;
mod retransmit_table;
mod seqno;

pub use ack_table::AckTable;
pub use ack_window::AckReceiverWindow;
pub use bounded_list::BoundedList;
pub use errors::{WindowError, WindowResult};
pub use interval::Interval;
pub use nak_window::{AddResult, NakReceiverWindow, WindowStats};
pub use retransmit_table::RetransmitTable;
pub use seqno::{Range, Seqno, SeqnoRange};
