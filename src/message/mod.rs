//! Messages and the wire format
//!
//! - `Message`: destination, source, payload, per-protocol headers, flags
//! - `MessageBatch`: messages received together from one sender
//! - `Header`: closed set of protocol headers keyed by `ProtocolId`
//! - `HeaderRegistry`: protocol id to decoder table, one per stack
//! - `codec`: versioned, checksummed frame encoding

pub mod codec;
mod batch;
mod errors;
mod flags;
mod header;
mod message;
mod registry;

pub use batch::MessageBatch;
pub use codec::{decode_frame, encode_frame, encoded_size, Frame, Reader, WIRE_VERSION};
pub use errors::{CodecError, CodecResult};
pub use flags::{Flags, TransientFlags};
pub use header::{
    ConnSide, FlowHeader, FragHeader, GmsHeader, Header, JoinResult, MergeId, NakackHeader,
    ProtocolId, UnicastHeader, MAX_FRAGMENTS,
};
pub use message::Message;
pub use registry::{HeaderDecoder, HeaderRegistry};
