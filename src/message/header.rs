//! Protocol headers
//!
//! Every protocol that needs to attach state to a message owns one header
//! variant, keyed on the wire by a small integer `ProtocolId`. Headers are a
//! closed enum; the `HeaderRegistry` maps ids to decoder functions so an
//! unknown or duplicate id is detected rather than guessed.

use std::fmt;

use bytes::{BufMut, BytesMut};

use super::codec::{put_addresses, put_address, put_digest, put_str, put_view, put_view_id, Reader};
use super::errors::{CodecError, CodecResult};
use crate::address::Address;
use crate::view::{Digest, View, ViewId};

/// Small integer identifying a protocol on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolId(pub u16);

impl ProtocolId {
    pub const TRANSPORT: ProtocolId = ProtocolId(1);
    pub const NAKACK: ProtocolId = ProtocolId(2);
    pub const UNICAST: ProtocolId = ProtocolId(3);
    pub const GMS: ProtocolId = ProtocolId(4);
    pub const FLOW_MULTICAST: ProtocolId = ProtocolId(5);
    pub const FLOW_UNICAST: ProtocolId = ProtocolId(6);
    pub const FRAG: ProtocolId = ProtocolId(7);
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ==================
// NAKACK
// ==================

/// Reliable multicast header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NakackHeader {
    /// Regular message with its per-sender seqno.
    Msg { seqno: u64 },
    /// Ask `sender`'s messages `[low, high]` to be resent.
    XmitRequest { sender: Address, low: u64, high: u64 },
    /// A resent message; `src` is still the original sender.
    XmitResponse { seqno: u64 },
    /// Stability gossip: the highest seqno delivered per sender.
    Stable { digest: Digest },
}

impl NakackHeader {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            NakackHeader::Msg { seqno } => {
                buf.put_u8(0);
                buf.put_u64(*seqno);
            }
            NakackHeader::XmitRequest { sender, low, high } => {
                buf.put_u8(1);
                put_address(buf, sender);
                buf.put_u64(*low);
                buf.put_u64(*high);
            }
            NakackHeader::XmitResponse { seqno } => {
                buf.put_u8(2);
                buf.put_u64(*seqno);
            }
            NakackHeader::Stable { digest } => {
                buf.put_u8(3);
                put_digest(buf, digest);
            }
        }
    }

    /// Registry decoder.
    pub fn decode(r: &mut Reader<'_>) -> CodecResult<Header> {
        let h = match r.u8()? {
            0 => NakackHeader::Msg { seqno: r.u64()? },
            1 => {
                let sender = r.address()?;
                let low = r.u64()?;
                let high = r.u64()?;
                if low > high {
                    return Err(CodecError::malformed(
                        "NAKACK",
                        format!("xmit range [{}, {}] is inverted", low, high),
                    ));
                }
                NakackHeader::XmitRequest { sender, low, high }
            }
            2 => NakackHeader::XmitResponse { seqno: r.u64()? },
            3 => NakackHeader::Stable { digest: r.digest()? },
            t => return Err(CodecError::malformed("NAKACK", format!("bad type {}", t))),
        };
        Ok(Header::Nakack(h))
    }
}

// ==================
// UNICAST
// ==================

/// End of a connection a `Close` refers to, seen from whoever sends it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnSide {
    /// The sender's own outgoing connection is gone
    Send,
    /// The sender has no incoming connection with this id
    Receive,
}

/// Reliable unicast header. Every variant names the connection it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnicastHeader {
    Data { conn_id: u32, seqno: u64 },
    /// Cumulative acknowledgment of everything up to `seqno`.
    Ack { conn_id: u32, seqno: u64 },
    Connect { conn_id: u32 },
    ConnectAck { conn_id: u32 },
    XmitRequest { conn_id: u32, low: u64, high: u64 },
    Close { conn_id: u32, side: ConnSide },
}

impl UnicastHeader {
    /// Connection id carried by the header.
    pub fn conn_id(&self) -> u32 {
        match self {
            UnicastHeader::Data { conn_id, .. }
            | UnicastHeader::Ack { conn_id, .. }
            | UnicastHeader::Connect { conn_id }
            | UnicastHeader::ConnectAck { conn_id }
            | UnicastHeader::XmitRequest { conn_id, .. }
            | UnicastHeader::Close { conn_id, .. } => *conn_id,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        match *self {
            UnicastHeader::Data { conn_id, seqno } => {
                buf.put_u8(0);
                buf.put_u32(conn_id);
                buf.put_u64(seqno);
            }
            UnicastHeader::Ack { conn_id, seqno } => {
                buf.put_u8(1);
                buf.put_u32(conn_id);
                buf.put_u64(seqno);
            }
            UnicastHeader::Connect { conn_id } => {
                buf.put_u8(2);
                buf.put_u32(conn_id);
            }
            UnicastHeader::ConnectAck { conn_id } => {
                buf.put_u8(3);
                buf.put_u32(conn_id);
            }
            UnicastHeader::XmitRequest { conn_id, low, high } => {
                buf.put_u8(4);
                buf.put_u32(conn_id);
                buf.put_u64(low);
                buf.put_u64(high);
            }
            UnicastHeader::Close { conn_id, side } => {
                buf.put_u8(5);
                buf.put_u32(conn_id);
                buf.put_u8(match side {
                    ConnSide::Send => 0,
                    ConnSide::Receive => 1,
                });
            }
        }
    }

    /// Registry decoder.
    pub fn decode(r: &mut Reader<'_>) -> CodecResult<Header> {
        let kind = r.u8()?;
        let conn_id = r.u32()?;
        let h = match kind {
            0 => UnicastHeader::Data {
                conn_id,
                seqno: r.u64()?,
            },
            1 => UnicastHeader::Ack {
                conn_id,
                seqno: r.u64()?,
            },
            2 => UnicastHeader::Connect { conn_id },
            3 => UnicastHeader::ConnectAck { conn_id },
            4 => UnicastHeader::XmitRequest {
                conn_id,
                low: r.u64()?,
                high: r.u64()?,
            },
            5 => UnicastHeader::Close {
                conn_id,
                side: match r.u8()? {
                    0 => ConnSide::Send,
                    1 => ConnSide::Receive,
                    s => {
                        return Err(CodecError::malformed("UNICAST", format!("bad side {}", s)))
                    }
                },
            },
            t => return Err(CodecError::malformed("UNICAST", format!("bad type {}", t))),
        };
        Ok(Header::Unicast(h))
    }
}

// ==================
// GMS
// ==================

/// Identifier of one merge attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MergeId {
    pub initiator: Address,
    pub id: u64,
}

impl fmt::Display for MergeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.initiator, self.id)
    }
}

/// Outcome of a join request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinResult {
    /// The joiner is part of `view`; `digest` is the state to start from.
    Accepted { view: View, digest: Digest },
    Rejected { reason: String },
}

/// Group membership header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GmsHeader {
    JoinRequest,
    JoinResponse(JoinResult),
    LeaveRequest,
    LeaveResponse,
    View { view: View },
    ViewAck { view_id: ViewId },
    MergeRequest { merge_id: MergeId, members: Vec<Address> },
    /// `None` means the merge was rejected by the responder.
    MergeResponse {
        merge_id: MergeId,
        data: Option<(View, Digest)>,
    },
    InstallMergeView {
        merge_id: MergeId,
        view: View,
        digest: Digest,
    },
    CancelMerge { merge_id: MergeId },
}

fn put_merge_id(buf: &mut BytesMut, merge_id: &MergeId) {
    put_address(buf, &merge_id.initiator);
    buf.put_u64(merge_id.id);
}

fn read_merge_id(r: &mut Reader<'_>) -> CodecResult<MergeId> {
    Ok(MergeId {
        initiator: r.address()?,
        id: r.u64()?,
    })
}

impl GmsHeader {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            GmsHeader::JoinRequest => buf.put_u8(0),
            GmsHeader::JoinResponse(result) => {
                buf.put_u8(1);
                match result {
                    JoinResult::Accepted { view, digest } => {
                        buf.put_u8(0);
                        put_view(buf, view);
                        put_digest(buf, digest);
                    }
                    JoinResult::Rejected { reason } => {
                        buf.put_u8(1);
                        put_str(buf, reason);
                    }
                }
            }
            GmsHeader::LeaveRequest => buf.put_u8(2),
            GmsHeader::LeaveResponse => buf.put_u8(3),
            GmsHeader::View { view } => {
                buf.put_u8(4);
                put_view(buf, view);
            }
            GmsHeader::ViewAck { view_id } => {
                buf.put_u8(5);
                put_view_id(buf, view_id);
            }
            GmsHeader::MergeRequest { merge_id, members } => {
                buf.put_u8(6);
                put_merge_id(buf, merge_id);
                put_addresses(buf, members);
            }
            GmsHeader::MergeResponse { merge_id, data } => {
                buf.put_u8(7);
                put_merge_id(buf, merge_id);
                match data {
                    Some((view, digest)) => {
                        buf.put_u8(1);
                        put_view(buf, view);
                        put_digest(buf, digest);
                    }
                    None => buf.put_u8(0),
                }
            }
            GmsHeader::InstallMergeView {
                merge_id,
                view,
                digest,
            } => {
                buf.put_u8(8);
                put_merge_id(buf, merge_id);
                put_view(buf, view);
                put_digest(buf, digest);
            }
            GmsHeader::CancelMerge { merge_id } => {
                buf.put_u8(9);
                put_merge_id(buf, merge_id);
            }
        }
    }

    /// Registry decoder.
    pub fn decode(r: &mut Reader<'_>) -> CodecResult<Header> {
        let h = match r.u8()? {
            0 => GmsHeader::JoinRequest,
            1 => match r.u8()? {
                0 => GmsHeader::JoinResponse(JoinResult::Accepted {
                    view: r.view()?,
                    digest: r.digest()?,
                }),
                1 => GmsHeader::JoinResponse(JoinResult::Rejected {
                    reason: r.str("reason")?,
                }),
                t => {
                    return Err(CodecError::malformed(
                        "GMS",
                        format!("bad join result {}", t),
                    ))
                }
            },
            2 => GmsHeader::LeaveRequest,
            3 => GmsHeader::LeaveResponse,
            4 => GmsHeader::View { view: r.view()? },
            5 => GmsHeader::ViewAck {
                view_id: r.view_id()?,
            },
            6 => GmsHeader::MergeRequest {
                merge_id: read_merge_id(r)?,
                members: r.addresses()?,
            },
            7 => {
                let merge_id = read_merge_id(r)?;
                let data = if r.bool()? {
                    Some((r.view()?, r.digest()?))
                } else {
                    None
                };
                GmsHeader::MergeResponse { merge_id, data }
            }
            8 => GmsHeader::InstallMergeView {
                merge_id: read_merge_id(r)?,
                view: r.view()?,
                digest: r.digest()?,
            },
            9 => GmsHeader::CancelMerge {
                merge_id: read_merge_id(r)?,
            },
            t => return Err(CodecError::malformed("GMS", format!("bad type {}", t))),
        };
        Ok(Header::Gms(h))
    }
}

// ==================
// Flow control
// ==================

/// Credit-based flow control header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowHeader {
    /// Receiver grants `credits` more bytes to the sender.
    Replenish { credits: u64 },
    /// Blocked sender asks for `requested` bytes.
    CreditRequest { requested: u64 },
}

impl FlowHeader {
    fn encode(&self, buf: &mut BytesMut) {
        match *self {
            FlowHeader::Replenish { credits } => {
                buf.put_u8(0);
                buf.put_u64(credits);
            }
            FlowHeader::CreditRequest { requested } => {
                buf.put_u8(1);
                buf.put_u64(requested);
            }
        }
    }

    /// Registry decoder.
    pub fn decode(r: &mut Reader<'_>) -> CodecResult<Header> {
        let h = match r.u8()? {
            0 => FlowHeader::Replenish { credits: r.u64()? },
            1 => FlowHeader::CreditRequest {
                requested: r.u64()?,
            },
            t => return Err(CodecError::malformed("FLOW", format!("bad type {}", t))),
        };
        Ok(Header::Flow(h))
    }
}

// ==================
// Fragmentation
// ==================

/// Upper bound on the fragment count a header may claim.
pub const MAX_FRAGMENTS: u32 = 1 << 16;

/// Fragment header: which original message and which piece of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragHeader {
    pub frag_id: u64,
    pub index: u32,
    pub count: u32,
}

impl FragHeader {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.frag_id);
        buf.put_u32(self.index);
        buf.put_u32(self.count);
    }

    /// Registry decoder.
    pub fn decode(r: &mut Reader<'_>) -> CodecResult<Header> {
        let frag_id = r.u64()?;
        let index = r.u32()?;
        let count = r.u32()?;
        if count == 0 || count > MAX_FRAGMENTS || index >= count {
            return Err(CodecError::malformed(
                "FRAG",
                format!("fragment {} of {}", index, count),
            ));
        }
        Ok(Header::Frag(FragHeader {
            frag_id,
            index,
            count,
        }))
    }
}

// ==================
// Header
// ==================

/// Any protocol header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Nakack(NakackHeader),
    Unicast(UnicastHeader),
    Gms(GmsHeader),
    Flow(FlowHeader),
    Frag(FragHeader),
}

impl Header {
    /// Encode the header body (without id or length prefix).
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Header::Nakack(h) => h.encode(buf),
            Header::Unicast(h) => h.encode(buf),
            Header::Gms(h) => h.encode(buf),
            Header::Flow(h) => h.encode(buf),
            Header::Frag(h) => h.encode(buf),
        }
    }

    /// Protocol name, for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Header::Nakack(_) => "NAKACK",
            Header::Unicast(_) => "UNICAST",
            Header::Gms(_) => "GMS",
            Header::Flow(_) => "FLOW",
            Header::Frag(_) => "FRAG",
        }
    }
}
