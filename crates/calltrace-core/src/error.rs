//! Error types for calltrace-core

use thiserror::Error;

/// Errors a backend collaborator can report
#[derive(Debug, Error)]
pub enum BackendError {
    /// Transport-level failure (connection refused, reset, DNS, ...)
    #[error("Network error: {0}")]
    Network(String),

    /// The request did not complete within the configured timeout
    #[error("Backend request timed out")]
    Timeout,

    /// The backend answered but refused the request
    #[error("Backend rejected request: {status} - {message}")]
    Rejected { status: u16, message: String },

    /// Only the first `sent` events of a batch were accepted
    #[error("Partial batch failure after {sent} events: {source}")]
    Partial {
        sent: usize,
        #[source]
        source: Box<BackendError>,
    },

    /// A referenced object does not exist
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else
    #[error("Backend error: {0}")]
    Other(#[from] anyhow::Error),
}

impl BackendError {
    /// Whether delivering the same events again may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Network(_) | BackendError::Timeout | BackendError::Io(_) => true,
            BackendError::Rejected { status, .. } => *status >= 500 || *status == 429,
            BackendError::Partial { source, .. } => source.is_retryable(),
            BackendError::NotFound(_)
            | BackendError::Serialization(_)
            | BackendError::Other(_) => false,
        }
    }

    /// Number of leading events that were accepted before the failure
    pub fn accepted(&self) -> usize {
        match self {
            BackendError::Partial { sent, .. } => *sent,
            _ => 0,
        }
    }

    /// Create a rejection from status and message
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        BackendError::Rejected {
            status,
            message: message.into(),
        }
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Malformed object reference
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefError {
    #[error("Reference must start with {expected}: {uri}")]
    BadScheme { uri: String, expected: &'static str },

    #[error("Reference has {found} path segments, expected 4: {uri}")]
    BadPath { uri: String, found: usize },

    #[error("Reference is missing a digest: {0}")]
    MissingDigest(String),

    #[error("Unknown object kind '{0}'")]
    UnknownKind(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable() {
        assert!(BackendError::Timeout.is_retryable());
        assert!(BackendError::Network("reset".to_string()).is_retryable());
        assert!(BackendError::rejected(503, "unavailable").is_retryable());
        assert!(BackendError::rejected(429, "slow down").is_retryable());
        assert!(!BackendError::rejected(400, "bad batch").is_retryable());
        assert!(!BackendError::NotFound("calltrace:///a/b/op/c:d".to_string()).is_retryable());
    }

    #[test]
    fn test_partial_inherits_retryability() {
        let err = BackendError::Partial {
            sent: 3,
            source: Box::new(BackendError::Timeout),
        };
        assert!(err.is_retryable());
        assert_eq!(err.accepted(), 3);
        assert_eq!(BackendError::Timeout.accepted(), 0);
    }
}
