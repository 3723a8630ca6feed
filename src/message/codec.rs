//! Wire codec
//!
//! Frame layout (big endian):
//!
//! ```text
//! version:u16 | flags:u8 | cluster:str16 | count:u32 | message* | crc32:u32
//! ```
//!
//! Each message:
//!
//! ```text
//! flags:u16 | dest?:addr | src?:addr | nheaders:u16 | (id:u16 len:u32 bytes)* | len:u32 payload
//! ```
//!
//! The checksum covers every byte before it. A frame that fails the checksum
//! is dropped whole; individual messages are never partially accepted.

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use super::errors::{CodecError, CodecResult};
use super::message::Message;
use super::registry::HeaderRegistry;
use super::Flags;
use crate::address::Address;
use crate::view::{Digest, DigestEntry, View, ViewId};

/// Current wire version.
pub const WIRE_VERSION: u16 = 1;

/// Frame flag: destination is the whole group.
pub const FRAME_MULTICAST: u8 = 0x01;
/// Frame flag: frame carries more than one message.
pub const FRAME_LIST: u8 = 0x02;

/// A decoded frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub cluster: String,
    pub multicast: bool,
    pub messages: Vec<Message>,
}

// ==================
// Primitive writers
// ==================

/// Write a u16-length-prefixed UTF-8 string.
pub fn put_str(buf: &mut BytesMut, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(u16::MAX as usize);
    buf.put_u16(len as u16);
    buf.put_slice(&bytes[..len]);
}

/// Write an address: 16-byte uuid, site marker, optional site string.
pub fn put_address(buf: &mut BytesMut, addr: &Address) {
    buf.put_slice(addr.uuid().as_bytes());
    match addr.site() {
        Some(site) => {
            buf.put_u8(1);
            put_str(buf, site);
        }
        None => buf.put_u8(0),
    }
}

/// Write an optional address with a presence byte.
pub fn put_opt_address(buf: &mut BytesMut, addr: Option<&Address>) {
    match addr {
        Some(a) => {
            buf.put_u8(1);
            put_address(buf, a);
        }
        None => buf.put_u8(0),
    }
}

/// Write an address list with a u32 count.
pub fn put_addresses(buf: &mut BytesMut, addrs: &[Address]) {
    buf.put_u32(addrs.len() as u32);
    for a in addrs {
        put_address(buf, a);
    }
}

/// Write a view id: creator address then id.
pub fn put_view_id(buf: &mut BytesMut, vid: &ViewId) {
    put_address(buf, vid.creator());
    buf.put_u64(vid.id());
}

/// Write a view: view id then ordered member list.
pub fn put_view(buf: &mut BytesMut, view: &View) {
    put_view_id(buf, view.view_id());
    put_addresses(buf, view.members());
}

/// Write a digest: count, then (address, low, highest delivered, highest received).
pub fn put_digest(buf: &mut BytesMut, digest: &Digest) {
    buf.put_u32(digest.len() as u32);
    for (addr, entry) in digest.iter() {
        put_address(buf, addr);
        buf.put_u64(entry.low);
        buf.put_u64(entry.highest_delivered);
        buf.put_u64(entry.highest_received);
    }
}

// ==================
// Reader
// ==================

/// Bounds-checked cursor over an encoded buffer.
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    /// Create a reader over `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        if self.buf.len() < n {
            return Err(CodecError::Truncated {
                needed: n,
                remaining: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn u8(&mut self) -> CodecResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> CodecResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> CodecResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> CodecResult<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    pub fn bool(&mut self) -> CodecResult<bool> {
        Ok(self.u8()? != 0)
    }

    /// Read `n` raw bytes.
    pub fn bytes(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        self.take(n)
    }

    /// Read a u16-length-prefixed UTF-8 string.
    pub fn str(&mut self, field: &'static str) -> CodecResult<String> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8(field))
    }

    pub fn address(&mut self) -> CodecResult<Address> {
        let raw = self.take(16)?;
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(raw);
        let addr = Address::from_uuid(Uuid::from_bytes(uuid));
        if self.bool()? {
            let site = self.str("site")?;
            Ok(addr.with_site(site))
        } else {
            Ok(addr)
        }
    }

    pub fn opt_address(&mut self) -> CodecResult<Option<Address>> {
        if self.bool()? {
            Ok(Some(self.address()?))
        } else {
            Ok(None)
        }
    }

    pub fn addresses(&mut self) -> CodecResult<Vec<Address>> {
        let n = self.u32()? as usize;
        // Every address needs at least 17 bytes; reject absurd counts early.
        if n.saturating_mul(17) > self.remaining() {
            return Err(CodecError::Truncated {
                needed: n.saturating_mul(17),
                remaining: self.remaining(),
            });
        }
        (0..n).map(|_| self.address()).collect()
    }

    pub fn view_id(&mut self) -> CodecResult<ViewId> {
        let creator = self.address()?;
        let id = self.u64()?;
        Ok(ViewId::new(creator, id))
    }

    pub fn view(&mut self) -> CodecResult<View> {
        let vid = self.view_id()?;
        let members = self.addresses()?;
        Ok(View::new(vid, members))
    }

    pub fn digest(&mut self) -> CodecResult<Digest> {
        let n = self.u32()? as usize;
        let mut digest = Digest::new();
        for _ in 0..n {
            let addr = self.address()?;
            let low = self.u64()?;
            let hd = self.u64()?;
            let hr = self.u64()?;
            digest.insert(addr, DigestEntry::new(low, hd, hr));
        }
        Ok(digest)
    }
}

// ==================
// Messages and frames
// ==================

/// Append one message to `buf`.
pub fn encode_message(buf: &mut BytesMut, msg: &Message) {
    buf.put_u16(msg.flags().bits());
    put_opt_address(buf, msg.dest());
    put_opt_address(buf, msg.src());
    buf.put_u16(msg.headers().len() as u16);
    let mut scratch = BytesMut::new();
    for (id, header) in msg.headers() {
        scratch.clear();
        header.encode(&mut scratch);
        buf.put_u16(id.0);
        buf.put_u32(scratch.len() as u32);
        buf.put_slice(&scratch);
    }
    buf.put_u32(msg.payload().len() as u32);
    buf.put_slice(msg.payload());
}

/// Decode one message.
pub fn decode_message(r: &mut Reader<'_>, registry: &HeaderRegistry) -> CodecResult<Message> {
    let flags = Flags::from_bits(r.u16()?);
    let dest = r.opt_address()?;
    let src = r.opt_address()?;
    let nheaders = r.u16()?;
    let mut headers = Vec::with_capacity(nheaders as usize);
    for _ in 0..nheaders {
        let id = r.u16()?;
        let len = r.u32()? as usize;
        let mut sub = Reader::new(r.bytes(len)?);
        let header = registry.decode(id, &mut sub)?;
        headers.push((super::ProtocolId(id), header));
    }
    let len = r.u32()? as usize;
    let payload = Bytes::copy_from_slice(r.bytes(len)?);

    let mut msg = Message::new(dest, payload);
    msg.set_src_opt(src);
    msg.set_flags(flags);
    for (id, header) in headers {
        msg.put_header(id, header);
    }
    Ok(msg)
}

/// Number of bytes `msg` occupies inside a frame.
pub fn encoded_size(msg: &Message) -> usize {
    let mut buf = BytesMut::new();
    encode_message(&mut buf, msg);
    buf.len()
}

/// Encode a frame carrying `messages`.
pub fn encode_frame(cluster: &str, multicast: bool, messages: &[Message]) -> Bytes {
    let mut buf = BytesMut::with_capacity(64 + messages.len() * 64);
    buf.put_u16(WIRE_VERSION);
    let mut flags = 0u8;
    if multicast {
        flags |= FRAME_MULTICAST;
    }
    if messages.len() > 1 {
        flags |= FRAME_LIST;
    }
    buf.put_u8(flags);
    put_str(&mut buf, cluster);
    buf.put_u32(messages.len() as u32);
    for msg in messages {
        encode_message(&mut buf, msg);
    }
    let crc = crc32fast::hash(&buf);
    buf.put_u32(crc);
    buf.freeze()
}

/// Decode and verify a frame.
pub fn decode_frame(data: &[u8], registry: &HeaderRegistry) -> CodecResult<Frame> {
    if data.len() < 4 {
        return Err(CodecError::Truncated {
            needed: 4,
            remaining: data.len(),
        });
    }
    let (body, tail) = data.split_at(data.len() - 4);
    let expected = u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]);
    let computed = crc32fast::hash(body);
    if expected != computed {
        return Err(CodecError::ChecksumMismatch { expected, computed });
    }

    let mut r = Reader::new(body);
    let version = r.u16()?;
    if version != WIRE_VERSION {
        return Err(CodecError::BadVersion(version));
    }
    let flags = r.u8()?;
    let cluster = r.str("cluster")?;
    let count = r.u32()? as usize;
    let mut messages = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        messages.push(decode_message(&mut r, registry)?);
    }
    Ok(Frame {
        cluster,
        multicast: flags & FRAME_MULTICAST != 0,
        messages,
    })
}
