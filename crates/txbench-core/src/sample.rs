use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BenchError;

/// Why a transaction ended up failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retries exhausted on optimistic-concurrency conflicts.
    Conflict,
    /// Retries exhausted on transient backend errors or attempt timeouts.
    Transient,
    /// Rejected by a constraint.
    Constraint,
    /// Rejected as a malformed statement.
    Statement,
}

impl FailureKind {
    /// Maps a per-transaction error to its kind. Fatal errors have none.
    pub fn from_error(error: &BenchError) -> Option<Self> {
        match error {
            BenchError::Conflict(_) => Some(Self::Conflict),
            BenchError::Transient(_) => Some(Self::Transient),
            BenchError::Constraint(_) => Some(Self::Constraint),
            BenchError::Statement(_) => Some(Self::Statement),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conflict => "conflict",
            Self::Transient => "transient",
            Self::Constraint => "constraint",
            Self::Statement => "statement",
        }
    }
}

/// Outcome of one transaction, after all of its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySample {
    /// First attempt start to final outcome, backoff included.
    pub duration: Duration,
    pub succeeded: bool,
    pub retry_count: u32,
    pub failure: Option<FailureKind>,
}

impl LatencySample {
    pub fn success(duration: Duration, retry_count: u32) -> Self {
        Self {
            duration,
            succeeded: true,
            retry_count,
            failure: None,
        }
    }

    pub fn failure(duration: Duration, retry_count: u32, kind: FailureKind) -> Self {
        Self {
            duration,
            succeeded: false,
            retry_count,
            failure: Some(kind),
        }
    }
}
