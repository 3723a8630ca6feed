//! Reliable multicast (NAKACK)
//!
//! Every multicast gets a per-sender seqno. Receivers keep one window per
//! member and deliver each sender's messages in seqno order:
//! - a gap starts retransmission requests to the original sender, on the
//!   configured backoff
//! - any member holding a message answers a retransmission request for it,
//!   keeping the original sender as source
//! - OOB messages go up as soon as they arrive and are skipped when the
//!   window later reaches them
//! - periodic stability gossip purges what every member has delivered
//!
//! Membership reads and writes this state through digests: `get_digest`
//! when handing state to a joiner, `set_digest`/`merge_digest` when
//! installing it, and `rebroadcast` to catch up after a merge.

mod history;
mod protocol;

pub use history::{DigestOperation, DigestRecord};
pub use protocol::Nakack;
