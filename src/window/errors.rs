//! # Window Errors
//!
//! Invalid parameters for windows, tables and intervals. Raised at
//! construction time only; once built, a window never fails.

use thiserror::Error;

/// Result type for window construction
pub type WindowResult<T> = Result<T, WindowError>;

/// Window construction errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WindowError {
    /// Zero rows or zero row length
    #[error("Invalid table dimensions: {rows} rows x {row_len} per row")]
    InvalidDimensions { rows: usize, row_len: usize },

    /// Resize factor must grow the table
    #[error("Invalid resize factor: {0} (must be > 1.0)")]
    InvalidResizeFactor(f64),

    /// Capacity must be positive
    #[error("Invalid capacity: {0}")]
    InvalidCapacity(usize),

    /// Range with low > high
    #[error("Invalid range: [{low}, {high}]")]
    InvalidRange { low: u64, high: u64 },

    /// Interval definition rejected
    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            WindowError::InvalidDimensions { rows: 0, row_len: 5 }.to_string(),
            "Invalid table dimensions: 0 rows x 5 per row"
        );
        assert_eq!(
            WindowError::InvalidRange { low: 9, high: 3 }.to_string(),
            "Invalid range: [9, 3]"
        );
    }
}
