//! Header registry
//!
//! Maps protocol ids to header decoders. One registry is built per protocol
//! stack when the stack is assembled; there is no process-global table.

use std::collections::HashMap;
use std::fmt;

use super::codec::Reader;
use super::errors::{CodecError, CodecResult};
use super::header::{FlowHeader, FragHeader, GmsHeader, Header, NakackHeader, ProtocolId, UnicastHeader};

/// Decoder for one protocol's header body.
pub type HeaderDecoder = fn(&mut Reader<'_>) -> CodecResult<Header>;

/// Protocol id to decoder table.
#[derive(Clone, Default)]
pub struct HeaderRegistry {
    decoders: HashMap<u16, (&'static str, HeaderDecoder)>,
}

impl fmt::Debug for HeaderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<(u16, &'static str)> =
            self.decoders.iter().map(|(id, (name, _))| (*id, *name)).collect();
        ids.sort();
        f.debug_struct("HeaderRegistry").field("protocols", &ids).finish()
    }
}

impl HeaderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in protocol registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let builtins: [(ProtocolId, &'static str, HeaderDecoder); 6] = [
            (ProtocolId::NAKACK, "NAKACK", NakackHeader::decode),
            (ProtocolId::UNICAST, "UNICAST", UnicastHeader::decode),
            (ProtocolId::GMS, "GMS", GmsHeader::decode),
            (ProtocolId::FLOW_MULTICAST, "MFC", FlowHeader::decode),
            (ProtocolId::FLOW_UNICAST, "UFC", FlowHeader::decode),
            (ProtocolId::FRAG, "FRAG", FragHeader::decode),
        ];
        for (id, name, decoder) in builtins {
            registry.decoders.insert(id.0, (name, decoder));
        }
        registry
    }

    /// Register a decoder. Registering an id twice is an error.
    pub fn register(
        &mut self,
        id: ProtocolId,
        name: &'static str,
        decoder: HeaderDecoder,
    ) -> CodecResult<()> {
        if let Some((existing, _)) = self.decoders.get(&id.0) {
            return Err(CodecError::DuplicateProtocolId {
                id: id.0,
                existing,
            });
        }
        self.decoders.insert(id.0, (name, decoder));
        Ok(())
    }

    /// Whether `id` has a decoder.
    pub fn contains(&self, id: ProtocolId) -> bool {
        self.decoders.contains_key(&id.0)
    }

    /// Name registered for `id`.
    pub fn name(&self, id: ProtocolId) -> Option<&'static str> {
        self.decoders.get(&id.0).map(|(name, _)| *name)
    }

    /// Decode a header body for `id`.
    pub fn decode(&self, id: u16, r: &mut Reader<'_>) -> CodecResult<Header> {
        match self.decoders.get(&id) {
            Some((_, decoder)) => decoder(r),
            None => Err(CodecError::UnknownProtocolId(id)),
        }
    }
}
