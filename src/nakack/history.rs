//! Digest history: the last few digests installed, for diagnostics.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::view::Digest;

/// How a digest was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestOperation {
    Set,
    Merge,
    Overwrite,
}

impl DigestOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestOperation::Set => "set",
            DigestOperation::Merge => "merge",
            DigestOperation::Overwrite => "overwrite",
        }
    }
}

/// One digest installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DigestRecord {
    pub at: DateTime<Utc>,
    pub operation: DigestOperation,
    pub digest: Digest,
}

impl DigestRecord {
    pub fn now(operation: DigestOperation, digest: Digest) -> Self {
        Self {
            at: Utc::now(),
            operation,
            digest,
        }
    }
}

impl fmt::Display for DigestRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: {}",
            self.at.to_rfc3339(),
            self.operation.as_str(),
            self.digest
        )
    }
}
