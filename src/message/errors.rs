//! # Codec Errors
//!
//! Error types for wire encoding and header registration.

use thiserror::Error;

/// Result type for codec operations
pub type CodecResult<T> = Result<T, CodecError>;

/// Codec errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    // ==================
    // Frame Errors
    // ==================
    /// Frame ended before a field could be read
    #[error("Truncated frame: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    /// Unsupported wire version
    #[error("Unsupported wire version: {0}")]
    BadVersion(u16),

    /// Checksum over the frame did not match
    #[error("Checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    /// A string field was not valid UTF-8
    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    // ==================
    // Header Errors
    // ==================
    /// No decoder registered for a protocol id
    #[error("Unknown protocol id: {0}")]
    UnknownProtocolId(u16),

    /// Header payload could not be decoded
    #[error("Malformed {protocol} header: {reason}")]
    MalformedHeader {
        protocol: &'static str,
        reason: String,
    },

    /// A protocol id was registered twice
    #[error("Protocol id {id} already registered by {existing}")]
    DuplicateProtocolId { id: u16, existing: &'static str },
}

impl CodecError {
    /// Create a malformed header error.
    pub fn malformed(protocol: &'static str, reason: impl Into<String>) -> Self {
        CodecError::MalformedHeader {
            protocol,
            reason: reason.into(),
        }
    }

    /// Registration errors are programming errors; everything else is a bad frame
    /// that the receiver drops.
    pub fn is_registration_error(&self) -> bool {
        matches!(self, CodecError::DuplicateProtocolId { .. })
    }
}
