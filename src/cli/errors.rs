//! CLI-specific error types
//!
//! Every CLI error ends the process with a non-zero exit code.

use std::fmt;
use std::io;

use crate::stack::StackError;

/// CLI error codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Configuration file error
    ConfigError,
    /// I/O error (stdout)
    IoError,
    /// A channel failed to connect or send
    ChannelError,
    /// The cluster did not converge in time
    Timeout,
}

impl CliErrorCode {
    /// Get the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError => "AEROCAST_CLI_CONFIG_ERROR",
            Self::IoError => "AEROCAST_CLI_IO_ERROR",
            Self::ChannelError => "AEROCAST_CLI_CHANNEL_ERROR",
            Self::Timeout => "AEROCAST_CLI_TIMEOUT",
        }
    }
}

/// CLI error
#[derive(Debug)]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    /// Create a new CLI error
    pub fn new(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ConfigError, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::IoError, msg)
    }

    pub fn channel_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ChannelError, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::Timeout, msg)
    }

    /// Get the error code
    pub fn code(&self) -> &CliErrorCode {
        &self.code
    }

    /// Get the error code string
    pub fn code_str(&self) -> &'static str {
        self.code.code()
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for CliError {}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::io_error(format!("JSON error: {}", e))
    }
}

impl From<StackError> for CliError {
    fn from(e: StackError) -> Self {
        match e {
            StackError::Config(msg) => Self::config_error(msg),
            other => Self::channel_error(other.to_string()),
        }
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_errors_map_to_codes() {
        let e: CliError = StackError::config("bad").into();
        assert_eq!(e.code(), &CliErrorCode::ConfigError);
        assert_eq!(e.message(), "bad");

        let e: CliError = StackError::JoinFailed { attempts: 3 }.into();
        assert_eq!(e.code_str(), "AEROCAST_CLI_CHANNEL_ERROR");
        assert!(e.to_string().starts_with("AEROCAST_CLI_CHANNEL_ERROR: "));
    }
}
