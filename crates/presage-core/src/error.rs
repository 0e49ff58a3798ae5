//! Engine error taxonomy: user errors, concurrency errors, infrastructure errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Every failure surfaced to callers maps to one of these kinds.
///
/// Infrastructure failures are fail-fast: a storage outage is never masked by
/// a default value or a silent fallback path.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Unknown or expired session.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Lock acquisition for the session timed out. Retryable.
    #[error("session busy: {0} (another operation holds the session lock)")]
    SessionBusy(String),

    /// Vector payload with the wrong dimensionality.
    #[error("invalid vector dimension: expected {expected}, got {got}")]
    InvalidVectorDim { expected: usize, got: usize },

    /// Unknown knowledge base.
    #[error("knowledge base not found: {0}")]
    KbNotFound(String),

    /// Any backend failure (store, index, corrupt record). Fatal to the request.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Out-of-range or malformed value in a config overlay.
    #[error("invalid config: {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },
}

impl EngineError {
    /// Stable machine-readable code for the wire surface.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionBusy(_) => "session_busy",
            Self::InvalidVectorDim { .. } => "invalid_vector_dim",
            Self::KbNotFound(_) => "kb_not_found",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::InvalidConfig { .. } => "invalid_config",
        }
    }

    /// Concurrency errors are safe to retry; everything else is not.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::SessionBusy(_))
    }
}

impl From<sled::Error> for EngineError {
    fn from(e: sled::Error) -> Self {
        Self::StorageUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        // A record that no longer decodes is a corrupt backend, not a user error.
        Self::StorageUnavailable(format!("undecodable record: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_distinct() {
        let errors = [
            EngineError::SessionNotFound("s".into()),
            EngineError::SessionBusy("s".into()),
            EngineError::InvalidVectorDim { expected: 768, got: 3 },
            EngineError::KbNotFound("k".into()),
            EngineError::StorageUnavailable("down".into()),
            EngineError::InvalidConfig { field: "persistence", reason: "zero".into() },
        ];
        let kinds: std::collections::HashSet<_> = errors.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds.len(), errors.len());
    }

    #[test]
    fn only_busy_is_retryable() {
        assert!(EngineError::SessionBusy("s".into()).retryable());
        assert!(!EngineError::KbNotFound("k".into()).retryable());
        assert!(!EngineError::StorageUnavailable("x".into()).retryable());
    }

    #[test]
    fn messages_identify_the_offender() {
        let e = EngineError::InvalidVectorDim { expected: 768, got: 42 };
        assert!(e.to_string().contains("768"));
        assert!(e.to_string().contains("42"));
        let e = EngineError::SessionNotFound("abc-123".into());
        assert!(e.to_string().contains("abc-123"));
    }
}
