use std::fmt;

use serde::Deserialize;
use thiserror::Error;

/// Failure reported by the orchestrator client capability.
///
/// `status` carries the HTTP-style status code when the orchestrator returned
/// one; `message` is the human-readable text pulled from its error body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrchestratorError {
    pub status: Option<u16>,
    pub message: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

impl OrchestratorError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Some(404), message)
    }

    /// Build an error from a structured error body, using its `message`
    /// field when present.
    pub fn from_body(status: Option<u16>, body: &str) -> Self {
        let message = serde_json::from_str::<ErrorBody>(body)
            .ok()
            .and_then(|parsed| parsed.message)
            .filter(|message| !message.is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        Self::new(status, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for OrchestratorError {}

/// Error type for the reconciliation core.
#[derive(Error, Debug)]
pub enum AvesError {
    /// Malformed submission or selector; never retried.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{0}")]
    Orchestrator(#[from] OrchestratorError),

    /// Unrecognized or malformed watch event; logged and dropped.
    #[error("unrecognized event: {0}")]
    ReconciliationInput(String),

    #[error("workers already materialized for job {0}")]
    DuplicateMaterialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),
}

impl AvesError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Lift a capability error, keeping typed variants that were wrapped
    /// by a store or client implementation.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        match err.downcast::<AvesError>() {
            Ok(typed) => typed,
            Err(err) => match err.downcast::<OrchestratorError>() {
                Ok(orchestrator) => Self::Orchestrator(orchestrator),
                Err(err) => Self::Store(err),
            },
        }
    }

    /// Whether retrying the same operation later could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

/// Result type alias for aves operations.
pub type Result<T> = std::result::Result<T, AvesError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_body_extracts_message() {
        let err = OrchestratorError::from_body(
            Some(409),
            r#"{"kind":"Status","message":"jobs.batch \"a\" already exists","code":409}"#,
        );
        assert_eq!(err.message, "jobs.batch \"a\" already exists");
        assert_eq!(err.status, Some(409));
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_from_body_falls_back_to_unknown() {
        assert_eq!(OrchestratorError::from_body(Some(500), "<html>").message, "unknown");
        assert_eq!(OrchestratorError::from_body(None, "{}").message, "unknown");
    }

    #[test]
    fn test_from_anyhow_keeps_typed_errors() {
        let wrapped = anyhow::Error::new(AvesError::DuplicateMaterialization("u-ns-1".into()));
        assert!(matches!(
            AvesError::from_anyhow(wrapped),
            AvesError::DuplicateMaterialization(_)
        ));

        let wrapped = anyhow::Error::new(OrchestratorError::not_found("gone"));
        assert!(matches!(AvesError::from_anyhow(wrapped), AvesError::Orchestrator(_)));

        let other = AvesError::from_anyhow(anyhow::anyhow!("connection reset"));
        assert!(other.is_retryable());
    }
}
