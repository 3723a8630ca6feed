//! # Stack Errors
//!
//! Error types for the protocol stack, its transport boundary and the
//! channel API.

use thiserror::Error;

use crate::message::CodecError;
use crate::window::WindowError;

/// Result type for stack operations
pub type StackResult<T> = Result<T, StackError>;

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Failures at the transport boundary
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The peer closed the stream cleanly
    #[error("End of stream from {0}")]
    Eof(String),

    /// The connection was torn down abruptly
    #[error("Connection reset by {0}")]
    ConnectionReset(String),

    /// No route to the destination
    #[error("Destination unreachable: {0}")]
    Unreachable(String),

    /// The local endpoint is closed
    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Eof(_))
    }

    pub fn is_reset(&self) -> bool {
        matches!(self, Self::ConnectionReset(_))
    }

    /// Whether the owning unicast connection must be closed.
    pub fn closes_connection(&self) -> bool {
        self.is_eof() || self.is_reset()
    }
}

/// Protocol stack and channel errors
#[derive(Debug, Clone, Error)]
pub enum StackError {
    // ==================
    // Configuration Errors
    // ==================
    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Two protocols claim the same header id
    #[error("Duplicate protocol: {0}")]
    DuplicateProtocol(String),

    /// Window or table parameters rejected at construction
    #[error("Invalid window parameters: {0}")]
    Window(#[from] WindowError),

    // ==================
    // Wire Errors
    // ==================
    /// Frame or header could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    // ==================
    // Lifecycle Errors
    // ==================
    /// Joining the group failed after every attempt
    #[error("Join failed after {attempts} attempts")]
    JoinFailed { attempts: u32 },

    /// Join request rejected by the coordinator
    #[error("Join rejected: {0}")]
    JoinRejected(String),

    /// Operation requires a connected channel
    #[error("Channel not connected")]
    NotConnected,

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Payload would need more fragments than receivers accept
    #[error("Message of {size} bytes needs {fragments} fragments, limit is {limit}")]
    MessageTooLarge {
        size: usize,
        fragments: u64,
        limit: u32,
    },

    /// The channel or stack has been closed
    #[error("Closed")]
    Closed,

    // ==================
    // Internal Errors
    // ==================
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StackError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Whether a connect attempt failing with this error must give up.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::JoinFailed { .. } | Self::Closed | Self::Config(_) | Self::JoinRejected(_)
        )
    }
}

impl From<std::io::Error> for StackError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}
