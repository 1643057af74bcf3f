//! Error taxonomy shared by every component (spec §7).

use thiserror::Error;

/// The closed error taxonomy used internally and surfaced at API boundaries.
///
/// Every component function that can fail returns `Result<T, Error>`. HTTP
/// handlers in `flowctl-dispatch`/`flowctl-server` map each variant to the
/// status code documented on the variant.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// Caller supplied a syntactically or semantically invalid request.
    /// Not retryable. Surfaced as HTTP 400.
    #[error("validation error: {0}")]
    Validation(String),

    /// Referenced id is unknown. Surfaced as HTTP 404.
    #[error("not found: {0}")]
    NotFound(String),

    /// Concurrent modification detected (version mismatch), or an attempt to
    /// re-enqueue a dead-lettered task. Retryable by the caller after a
    /// re-read. Surfaced as HTTP 409.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Store unavailable, network timeout, or similar recoverable failure.
    /// Retried internally with jittered backoff; surfaced as HTTP 503 if
    /// retries are exhausted.
    #[error("transient error: {0}")]
    Transient(String),

    /// An invariant was broken. Logged with full context and surfaced as
    /// HTTP 500. Does not by itself transition any experiment to `Failed`.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True if the caller should retry the operation after a short backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// True if the caller should re-read state before retrying.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            // SQLSTATE 23xxx is the integrity-constraint-violation class.
            if db_err.code().code().starts_with("23") {
                return Error::Conflict(db_err.message().to_string());
            }
        }
        Error::Transient(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("serialization error: {err}"))
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_retryable() {
        assert!(Error::Transient("timeout".into()).is_retryable());
        assert!(!Error::Validation("bad".into()).is_retryable());
    }

    #[test]
    fn conflict_is_conflict() {
        assert!(Error::Conflict("version mismatch".into()).is_conflict());
        assert!(!Error::NotFound("x".into()).is_conflict());
    }

    #[test]
    fn json_error_maps_to_internal() {
        let bad: std::result::Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: Error = bad.unwrap_err().into();
        assert!(matches!(err, Error::Internal(_)));
    }
}
