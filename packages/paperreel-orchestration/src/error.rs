use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("stage not found: {0}")]
    StageNotFound(String),

    #[error("artifact not available: {0}")]
    ArtifactNotAvailable(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn parse<E: std::fmt::Display>(e: E) -> Self {
        Self::Parse(e.to_string())
    }

    pub fn registry<E: std::fmt::Display>(e: E) -> Self {
        Self::Registry(e.to_string())
    }
}

/// Failure classification shared by workers, the retry policy, and the store.
///
/// Workers report a subset of these; the executor synthesizes `Timeout`,
/// `Cancelled`, and `ContractViolation`; the store synthesizes `LeaseLost`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InputInvalid,
    Transient,
    Timeout,
    ContractViolation,
    ResourceExhausted,
    NonRetryable,
    Cancelled,
    LeaseLost,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InputInvalid => "input_invalid",
            ErrorKind::Transient => "transient",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ContractViolation => "contract_violation",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::NonRetryable => "non_retryable",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::LeaseLost => "lease_lost",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "input_invalid" => Ok(ErrorKind::InputInvalid),
            "transient" => Ok(ErrorKind::Transient),
            "timeout" => Ok(ErrorKind::Timeout),
            "contract_violation" => Ok(ErrorKind::ContractViolation),
            "resource_exhausted" => Ok(ErrorKind::ResourceExhausted),
            "non_retryable" => Ok(ErrorKind::NonRetryable),
            "cancelled" => Ok(ErrorKind::Cancelled),
            "lease_lost" => Ok(ErrorKind::LeaseLost),
            "internal" => Ok(ErrorKind::Internal),
            _ => Err(OrchestratorError::parse(format!(
                "Invalid error kind: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured stage failure, recorded on the stage state and surfaced on
/// terminal FAILED jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    pub suggested_fallback: bool,
}

impl StageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: matches!(
                kind,
                ErrorKind::Transient | ErrorKind::Timeout | ErrorKind::ResourceExhausted
            ),
            suggested_fallback: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancellation observed")
    }

    pub fn lease_lost() -> Self {
        Self::new(ErrorKind::LeaseLost, "lease expired or lost")
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceExhausted, message)
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NonRetryable, message)
    }

    /// Contract violations suggest a fallback worker by default.
    pub fn contract_violation(message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorKind::ContractViolation, message);
        err.suggested_fallback = true;
        err
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn with_fallback(mut self) -> Self {
        self.suggested_fallback = true;
        self
    }
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_roundtrip() {
        for kind in &[
            ErrorKind::InputInvalid,
            ErrorKind::Transient,
            ErrorKind::Timeout,
            ErrorKind::ContractViolation,
            ErrorKind::ResourceExhausted,
            ErrorKind::NonRetryable,
            ErrorKind::Cancelled,
            ErrorKind::LeaseLost,
            ErrorKind::Internal,
        ] {
            let s = kind.as_str();
            let parsed = ErrorKind::from_str(s).unwrap();
            assert_eq!(*kind, parsed);
        }
    }

    #[test]
    fn test_error_kind_invalid() {
        assert!(ErrorKind::from_str("bogus").is_err());
    }

    #[test]
    fn test_default_retryability() {
        assert!(StageError::transient("x").retryable);
        assert!(StageError::timeout("x").retryable);
        assert!(StageError::resource_exhausted("x").retryable);
        assert!(!StageError::non_retryable("x").retryable);
        assert!(!StageError::cancelled().retryable);
    }

    #[test]
    fn test_contract_violation_suggests_fallback() {
        let err = StageError::contract_violation("missing key");
        assert_eq!(err.kind, ErrorKind::ContractViolation);
        assert!(err.suggested_fallback);
        assert!(!err.retryable);
    }
}
