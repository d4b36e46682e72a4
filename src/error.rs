//! Engine Errors
//!
//! Every failure the engine handles is an [`EngineError`] tagged with an
//! [`ErrorKind`]. Retry decisions are a plain function over that tag
//! ([`classify`]), so callers can test and replace the policy without
//! matching on concrete collaborator error types.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Crate-wide result alias
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Shared, clonable source error
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Category of an operation failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Upstream asked us to slow down (HTTP 429 and friends)
    RateLimited,
    /// Upstream did not answer in time
    Timeout,
    /// Connection reset, DNS failure, 5xx
    Network,
    /// Credentials rejected
    Auth,
    /// Request was malformed or rejected by validation
    Validation,
    /// Requested entity does not exist
    NotFound,
    /// AI provider refused the content
    ContentPolicy,
    /// Result sink could not persist
    Sink,
    /// Anything else
    Internal,
}

impl ErrorKind {
    /// Transient kinds are worth another attempt; everything else is fatal.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::Timeout | Self::Network)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Auth => "auth",
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::ContentPolicy => "content_policy",
            Self::Sink => "sink",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced or propagated by the engine
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// A collaborator call failed
    #[error("{kind}: {message}")]
    Operation {
        kind: ErrorKind,
        message: String,
        /// Server-suggested wait before the next attempt
        retry_after: Option<Duration>,
        #[source]
        cause: Option<Cause>,
    },

    /// The retry budget ran out; `source` is the last error seen
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<EngineError>,
    },

    /// A batch item exceeded its per-item timeout
    #[error("item timed out after {timeout:?}")]
    ItemTimeout { timeout: Duration },

    /// The per-item function panicked
    #[error("worker panicked: {message}")]
    WorkerPanic { message: String },

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A cached value could not be encoded or decoded
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl EngineError {
    /// Build an operation error with no cause
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Operation {
            kind,
            message: message.into(),
            retry_after: None,
            cause: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::Operation {
            kind: ErrorKind::RateLimited,
            message: message.into(),
            retry_after,
            cause: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn content_policy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ContentPolicy, message)
    }

    pub fn sink(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Sink, message)
    }

    /// Attach an underlying error
    #[must_use]
    pub fn with_cause<E>(self, err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        match self {
            Self::Operation {
                kind,
                message,
                retry_after,
                ..
            } => Self::Operation {
                kind,
                message,
                retry_after,
                cause: Some(Arc::new(err)),
            },
            other => other,
        }
    }

    /// Tag of this error. Wrapper variants report the tag they map onto.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Operation { kind, .. } => *kind,
            Self::RetriesExhausted { source, .. } => source.kind(),
            Self::ItemTimeout { .. } => ErrorKind::Timeout,
            Self::Config(_) => ErrorKind::Validation,
            Self::WorkerPanic { .. } | Self::Serialization(_) => ErrorKind::Internal,
        }
    }

    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Operation { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Number of attempts this error represents
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::RetriesExhausted { attempts, .. } => *attempts,
            _ => 1,
        }
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Outcome of error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    Retryable,
    Fatal,
}

/// Default classification: transient kinds retry, the rest short-circuit.
///
/// An already-exhausted error is never retried again, even though its inner
/// kind is transient.
#[must_use]
pub fn classify(err: &EngineError) -> Retryability {
    match err {
        EngineError::RetriesExhausted { .. }
        | EngineError::WorkerPanic { .. }
        | EngineError::Config(_)
        | EngineError::Serialization(_) => Retryability::Fatal,
        EngineError::ItemTimeout { .. } => Retryability::Retryable,
        EngineError::Operation { kind, .. } => {
            if kind.is_retryable() {
                Retryability::Retryable
            } else {
                Retryability::Fatal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_transient_kinds_are_retryable() {
        assert_eq!(classify(&EngineError::rate_limited("429", None)), Retryability::Retryable);
        assert_eq!(classify(&EngineError::timeout("slow")), Retryability::Retryable);
        assert_eq!(classify(&EngineError::network("reset")), Retryability::Retryable);
    }

    #[test]
    fn test_fatal_kinds_short_circuit() {
        for err in [
            EngineError::auth("bad token"),
            EngineError::validation("missing field"),
            EngineError::not_found("ticket 9"),
            EngineError::content_policy("refused"),
        ] {
            assert_eq!(classify(&err), Retryability::Fatal, "{err}");
        }
    }

    #[test]
    fn test_exhausted_preserves_cause() {
        let last = EngineError::rate_limited("slow down", Some(Duration::from_secs(2)));
        let err = EngineError::RetriesExhausted {
            attempts: 4,
            source: Box::new(last),
        };

        assert_eq!(err.attempts(), 4);
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert_eq!(classify(&err), Retryability::Fatal);
        let source = err.source().map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("rate_limited: slow down"));
        assert!(err.to_string().contains("exhausted after 4 attempts"));
    }

    #[test]
    fn test_with_cause_is_exposed_as_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer reset");
        let err = EngineError::network("fetch tickets").with_cause(io);
        let source = err.source().map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("peer reset"));
    }
}
