//! Error types for the pipeline engine
//!
//! Three layers of errors live here:
//!
//! - [`ErrorKind`]: the closed, client-facing failure taxonomy reported in the
//!   final progress event of a failed run.
//! - [`StepFailure`]: what a step returns when it cannot continue.
//! - [`CollaboratorError`]: what the external collaborators (LLM, query
//!   backend, history store) report. These are translated into
//!   [`StepFailure`]s before they reach a client.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the engine itself (misuse or broken invariants)
#[derive(Debug, Error)]
pub enum EngineError {
    /// An engine invariant did not hold
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),
}

impl EngineError {
    /// Create an invariant violation with a message
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }
}

impl From<EngineError> for StepFailure {
    fn from(err: EngineError) -> Self {
        StepFailure::new(ErrorKind::InternalInvariantViolation, err.to_string())
    }
}

/// Closed failure taxonomy reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    GenerationFailed,
    ValidationExhausted,
    ExecutionFailed,
    Cancelled,
    CollaboratorUnavailable,
    InternalInvariantViolation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::GenerationFailed => "generation_failed",
            ErrorKind::ValidationExhausted => "validation_exhausted",
            ErrorKind::ExecutionFailed => "execution_failed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::CollaboratorUnavailable => "collaborator_unavailable",
            ErrorKind::InternalInvariantViolation => "internal_invariant_violation",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step's reason for not continuing.
///
/// `detail` is shown to the client, so it must never contain a raw
/// collaborator message.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {detail}")]
#[serde(rename_all = "camelCase")]
pub struct StepFailure {
    pub kind: ErrorKind,
    pub detail: String,
}

impl StepFailure {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "The request was cancelled")
    }

    pub fn invariant(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalInvariantViolation, detail)
    }

    /// Whether a retry loop may consume an attempt for this failure instead
    /// of ending the run.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.kind,
            ErrorKind::Cancelled | ErrorKind::InternalInvariantViolation
        )
    }
}

/// Errors reported by external collaborators
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    #[error("Collaborator call timed out")]
    Timeout,

    #[error("Collaborator rate limited the request")]
    RateLimited,

    #[error("Service error: {0}")]
    ServiceError(String),

    #[error("Query syntax error: {0}")]
    SyntaxError(String),

    #[error("Query execution error: {0}")]
    ExecutionError(String),

    #[error("History store unavailable: {0}")]
    StoreUnavailable(String),

    /// The collaborator answered, but not in the requested shape
    #[error("Malformed output: {0}")]
    MalformedOutput(String),

    #[error("Collaborator call cancelled")]
    Cancelled,
}

impl CollaboratorError {
    /// Translate into a client-safe step failure.
    ///
    /// `collaborator` names the service in the detail ("query generator",
    /// "query backend", ...). `output_kind` is the kind used when the
    /// collaborator answered with something unusable.
    pub fn into_step_failure(self, collaborator: &str, output_kind: ErrorKind) -> StepFailure {
        log::warn!("{} failed: {}", collaborator, self);
        match self {
            CollaboratorError::Timeout => StepFailure::new(
                ErrorKind::CollaboratorUnavailable,
                format!("The {} timed out", collaborator),
            ),
            CollaboratorError::RateLimited => StepFailure::new(
                ErrorKind::CollaboratorUnavailable,
                format!("The {} is rate limited, try again shortly", collaborator),
            ),
            CollaboratorError::ServiceError(_) | CollaboratorError::StoreUnavailable(_) => {
                StepFailure::new(
                    ErrorKind::CollaboratorUnavailable,
                    format!("The {} is unavailable", collaborator),
                )
            }
            CollaboratorError::SyntaxError(_) => StepFailure::new(
                ErrorKind::ExecutionFailed,
                "The query backend rejected the query as invalid",
            ),
            CollaboratorError::ExecutionError(_) => {
                StepFailure::new(ErrorKind::ExecutionFailed, "The query failed to execute")
            }
            CollaboratorError::MalformedOutput(_) => StepFailure::new(
                output_kind,
                format!("The {} returned an unusable response", collaborator),
            ),
            CollaboratorError::Cancelled => StepFailure::cancelled(),
        }
    }
}
