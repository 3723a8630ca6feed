//! Fragmentation (FRAG)
//!
//! Payloads above `frag_size` bytes leave as `count` pieces sharing a
//! fragment id. Receivers hold pieces per (sender, id) and deliver the
//! original message once every piece is in, whatever the arrival order.
//! Incomplete sets are dropped when they outlive the reassembly timeout or
//! when their sender leaves the view.

mod protocol;
mod table;

pub use protocol::Frag;
pub use table::FragmentTable;
