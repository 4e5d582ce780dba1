use thiserror::Error;

/// Canonical error type for benchmark operations.
#[derive(Debug, Error)]
pub enum BenchError {
    /// Session could not be established.
    #[error("connection error: {message}")]
    Connection {
        /// Human-readable driver message.
        message: String,
    },

    /// Transaction was rejected because a concurrent transaction modified the same rows.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Backend is temporarily unable to serve the request (overload, deadline exceeded).
    #[error("transient error: {0}")]
    Transient(String),

    /// Statement violated a database constraint.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Statement was rejected as malformed or invalid by the database.
    #[error("statement rejected: {0}")]
    Statement(String),

    /// Session is irrecoverably broken.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// Population of one initialization shard failed.
    #[error("initialization of shard {shard} failed: {source}")]
    Initialization {
        /// Index of the failed shard.
        shard: usize,
        /// Underlying cause.
        #[source]
        source: Box<BenchError>,
    },

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A child process failed to produce a result.
    #[error("process {index} failed: {reason}")]
    Process {
        /// Index of the child process.
        index: usize,
        /// Human-readable failure reason.
        reason: String,
    },

    /// I/O error occurred while talking to a child process or the terminal.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Message could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// How the worker state machine reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Re-enter the transaction after a backoff.
    Retryable,
    /// Record a failed transaction and continue with the next one.
    Rejected,
    /// Stop the owning worker.
    Fatal,
}

impl BenchError {
    /// Creates a `Connection` variant.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates an `Initialization` variant wrapping `source`.
    #[must_use]
    pub fn initialization(shard: usize, source: BenchError) -> Self {
        Self::Initialization {
            shard,
            source: Box::new(source),
        }
    }

    /// Creates a `Process` variant.
    #[must_use]
    pub fn process(index: usize, reason: impl Into<String>) -> Self {
        Self::Process {
            index,
            reason: reason.into(),
        }
    }

    /// Creates an `InvalidConfig` variant.
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Classifies the error for retry decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Conflict(_) | Self::Transient(_) => ErrorClass::Retryable,
            Self::Constraint(_) | Self::Statement(_) => ErrorClass::Rejected,
            _ => ErrorClass::Fatal,
        }
    }

    /// Returns true when the transaction may be retried.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}

impl From<serde_json::Error> for BenchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for BenchError {
    fn from(err: config::ConfigError) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}

/// Convenient result alias for benchmark operations.
pub type BenchResult<T> = Result<T, BenchError>;
