//! Error types for the session service

use pipeline_engine::RequestId;
use thiserror::Error;

/// Errors returned by the session service API
#[derive(Debug, Error)]
pub enum SessionServiceError {
    /// The service configuration is unusable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The request was rejected before a run was started
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A run with this request ID is already registered
    #[error("Request already registered: {0}")]
    DuplicateRequest(RequestId),
}

/// Result type alias using SessionServiceError
pub type Result<T> = std::result::Result<T, SessionServiceError>;
