//! Error types for the vellum orchestrator.
//!
//! Every component boundary in vellum returns this crate's [`Error`]. The
//! enum is closed on purpose: the fingerprint classifier
//! ([`crate::fingerprint::classify`]) must be able to map any failure the
//! system produces onto the serialisable fingerprint taxonomy without
//! downcasting.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::validate::IssueCode;

/// The result type used throughout vellum.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An identifier could not be parsed.
    #[error("invalid id: {message}")]
    InvalidId {
        /// Description of the parse failure.
        message: String,
    },

    /// Configuration was missing or invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// A manifest was requested for an unknown project.
    #[error("project not found: {id}")]
    ProjectNotFound {
        /// The project id that was not found.
        id: String,
    },

    /// An invalid status transition was attempted.
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        /// The current status.
        from: String,
        /// The attempted target status.
        to: String,
    },

    /// A schema validation failed.
    ///
    /// Carries the first reported issue; the full issue list is logged at
    /// the validation site.
    #[error("validation failed at {path}: {message} ({code})")]
    Validation {
        /// The validator-reported issue code.
        code: IssueCode,
        /// Dotted path of the first failing field.
        path: String,
        /// Human-readable description.
        message: String,
    },

    /// The LLM provider rejected or failed a request.
    #[error("provider error{}: {reason}", match .status { Some(s) => format!(" ({s})"), None => String::new() })]
    Provider {
        /// HTTP status, when the failure came from a parsed response.
        status: Option<u16>,
        /// Provider-reported reason or error type.
        reason: String,
    },

    /// A network-level failure reaching an external collaborator.
    #[error("network error: {message}")]
    Network {
        /// Description of the network failure.
        message: String,
    },

    /// A filesystem operation failed.
    #[error("filesystem error ({code}) at {}: {message}", .path.display())]
    Filesystem {
        /// Lowercased OS error code (`enoent`, `eacces`, ...).
        code: String,
        /// The path the operation touched.
        path: PathBuf,
        /// Description of the failure.
        message: String,
    },

    /// A serialization or persistence encoding error.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the encoding failure.
        message: String,
    },

    /// The priority queue rejected an admission request.
    #[error("queue full: {waiting} waiting, {in_flight} in flight")]
    QueueFull {
        /// Waiters at rejection time.
        waiting: usize,
        /// In-flight requests at rejection time.
        in_flight: usize,
    },

    /// The circuit breaker is open and fast-failing requests.
    #[error("circuit open: {consecutive_failures} consecutive failures")]
    CircuitOpen {
        /// Consecutive failures that tripped the breaker.
        consecutive_failures: u32,
        /// Total requests observed by the breaker.
        total_requests: u64,
        /// Total failures observed by the breaker.
        total_failures: u64,
        /// When the breaker last opened.
        opened_at: DateTime<Utc>,
    },

    /// Waiting for a pooled session exceeded the acquire timeout.
    #[error("connection pool acquire timed out after {waited_ms}ms")]
    PoolTimeout {
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// The pool is draining and refuses new acquires.
    #[error("connection pool is draining")]
    PoolDraining,

    /// A provider attempt exceeded its deadline.
    #[error("provider call exceeded {seconds}s deadline")]
    Deadline {
        /// The configured deadline.
        seconds: u64,
    },

    /// Every model in the fallback chain failed.
    #[error("all models failed after {models_tried} models: {last_error}")]
    AllModelsFailed {
        /// Number of models attempted.
        models_tried: usize,
        /// Message of the final failure.
        last_error: String,
    },

    /// Stale recovery was attempted past the configured cap.
    #[error("stale recovery cap reached ({count} recoveries)")]
    RecoveryExhausted {
        /// Recoveries performed so far.
        count: u32,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Maps an I/O failure to a [`Error::Filesystem`] with a stable code.
    #[must_use]
    pub fn filesystem(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        let code = match err.kind() {
            ErrorKind::NotFound => "enoent",
            ErrorKind::PermissionDenied => "eacces",
            ErrorKind::AlreadyExists => "eexist",
            ErrorKind::NotADirectory => "enotdir",
            ErrorKind::TimedOut => "etimedout",
            _ => "eio",
        };
        Self::Filesystem {
            code: code.to_string(),
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Returns true when the error represents a transient condition that a
    /// retry at the same model may clear.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network { .. }
                | Self::Deadline { .. }
                | Self::PoolTimeout { .. }
                | Self::QueueFull { .. }
                | Self::CircuitOpen { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}
