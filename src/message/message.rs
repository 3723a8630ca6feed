//! Messages
//!
//! A message is created by the application with a destination (or none for
//! the whole group) and a payload. The stack fills in the source, and each
//! protocol adds its own header on the way down and reads it on the way up.
//! The payload is an immutable `Bytes` buffer, so copies made for
//! retransmission or loopback share the same allocation.

use std::fmt;

use bytes::Bytes;

use super::flags::{Flags, TransientFlags};
use super::header::{Header, ProtocolId};
use crate::address::Address;

/// A message travelling through the protocol stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    dest: Option<Address>,
    src: Option<Address>,
    payload: Bytes,
    headers: Vec<(ProtocolId, Header)>,
    flags: Flags,
    transient: TransientFlags,
}

impl Message {
    /// Create a message; `dest == None` addresses the whole group.
    pub fn new(dest: Option<Address>, payload: impl Into<Bytes>) -> Self {
        Self {
            dest,
            src: None,
            payload: payload.into(),
            headers: Vec::new(),
            flags: Flags::empty(),
            transient: TransientFlags::empty(),
        }
    }

    /// Create an empty control message carrying only `header`.
    pub fn control(dest: Option<Address>, id: ProtocolId, header: Header) -> Self {
        let mut msg = Self::new(dest, Bytes::new());
        msg.set_flags(Flags::INTERNAL);
        msg.put_header(id, header);
        msg
    }

    pub fn dest(&self) -> Option<&Address> {
        self.dest.as_ref()
    }

    pub fn set_dest(&mut self, dest: Option<Address>) {
        self.dest = dest;
    }

    /// Whether the message is addressed to the whole group.
    pub fn is_multicast(&self) -> bool {
        self.dest.is_none()
    }

    pub fn src(&self) -> Option<&Address> {
        self.src.as_ref()
    }

    pub fn set_src(&mut self, src: Address) {
        self.src = Some(src);
    }

    pub(crate) fn set_src_opt(&mut self, src: Option<Address>) {
        self.src = src;
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: Bytes) {
        self.payload = payload;
    }

    /// Payload length in bytes; this is what flow control charges.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Add `flags` to the flags already set.
    pub fn set_flags(&mut self, flags: Flags) {
        self.flags.insert(flags);
    }

    pub fn clear_flags(&mut self, flags: Flags) {
        self.flags.remove(flags);
    }

    pub fn is_flag_set(&self, flag: Flags) -> bool {
        self.flags.contains(flag)
    }

    pub fn transient_flags(&self) -> TransientFlags {
        self.transient
    }

    pub fn set_transient_flags(&mut self, flags: TransientFlags) {
        self.transient.insert(flags);
    }

    pub fn clear_transient_flags(&mut self, flags: TransientFlags) {
        self.transient.remove(flags);
    }

    pub fn is_transient_flag_set(&self, flag: TransientFlags) -> bool {
        self.transient.contains(flag)
    }

    /// Builder-style flag setter.
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.set_flags(flags);
        self
    }

    /// Builder-style transient flag setter.
    pub fn with_transient_flags(mut self, flags: TransientFlags) -> Self {
        self.set_transient_flags(flags);
        self
    }

    /// Attach a header, replacing any header with the same id.
    pub fn put_header(&mut self, id: ProtocolId, header: Header) {
        match self.headers.iter_mut().find(|(hid, _)| *hid == id) {
            Some(slot) => slot.1 = header,
            None => self.headers.push((id, header)),
        }
    }

    pub fn header(&self, id: ProtocolId) -> Option<&Header> {
        self.headers
            .iter()
            .find(|(hid, _)| *hid == id)
            .map(|(_, h)| h)
    }

    pub fn remove_header(&mut self, id: ProtocolId) -> Option<Header> {
        let pos = self.headers.iter().position(|(hid, _)| *hid == id)?;
        Some(self.headers.remove(pos).1)
    }

    pub fn headers(&self) -> &[(ProtocolId, Header)] {
        &self.headers
    }

    /// Copy of the message that shares the payload buffer.
    ///
    /// With `with_headers == false` the copy starts without headers, which is
    /// what fragmentation uses for each piece.
    pub fn copy(&self, with_headers: bool) -> Message {
        Message {
            dest: self.dest.clone(),
            src: self.src.clone(),
            payload: self.payload.clone(),
            headers: if with_headers {
                self.headers.clone()
            } else {
                Vec::new()
            },
            flags: self.flags,
            transient: self.transient,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        match &self.src {
            Some(s) => write!(f, "{}", s)?,
            None => write!(f, "?")?,
        }
        write!(f, " -> ")?;
        match &self.dest {
            Some(d) => write!(f, "{}", d)?,
            None => write!(f, "*")?,
        }
        write!(f, ", {} bytes", self.payload.len())?;
        if self.flags != Flags::empty() {
            write!(f, ", flags={}", self.flags)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{FragHeader, NakackHeader};

    #[test]
    fn test_headers_replace_by_id() {
        let mut msg = Message::new(None, Bytes::from_static(b"hello"));
        msg.put_header(ProtocolId::NAKACK, Header::Nakack(NakackHeader::Msg { seqno: 1 }));
        msg.put_header(ProtocolId::NAKACK, Header::Nakack(NakackHeader::Msg { seqno: 2 }));
        assert_eq!(msg.headers().len(), 1);
        assert_eq!(
            msg.header(ProtocolId::NAKACK),
            Some(&Header::Nakack(NakackHeader::Msg { seqno: 2 }))
        );

        assert!(msg.remove_header(ProtocolId::NAKACK).is_some());
        assert!(msg.header(ProtocolId::NAKACK).is_none());
    }

    #[test]
    fn test_copy_shares_payload() {
        let mut msg = Message::new(Some(Address::from_u128(1)), Bytes::from_static(b"abc"));
        msg.put_header(
            ProtocolId::FRAG,
            Header::Frag(FragHeader {
                frag_id: 1,
                index: 0,
                count: 1,
            }),
        );
        let full = msg.copy(true);
        let bare = msg.copy(false);
        assert_eq!(full, msg);
        assert!(bare.headers().is_empty());
        assert_eq!(bare.payload().as_ptr(), msg.payload().as_ptr());
    }

    #[test]
    fn test_flags_independent_from_transient() {
        let msg = Message::new(None, Bytes::new())
            .with_flags(Flags::OOB)
            .with_transient_flags(TransientFlags::DONT_LOOPBACK);
        assert!(msg.is_flag_set(Flags::OOB));
        assert!(msg.is_transient_flag_set(TransientFlags::DONT_LOOPBACK));
        assert!(msg.is_multicast());
    }

    #[test]
    fn test_control_message() {
        let msg = Message::control(
            None,
            ProtocolId::NAKACK,
            Header::Nakack(NakackHeader::Msg { seqno: 1 }),
        );
        assert!(msg.is_flag_set(Flags::INTERNAL));
        assert!(msg.is_empty());
    }
}
