//! Core error types for twinboot-core

use kameo::error::SendError;
use thiserror::Error;

/// Errors that can occur in core actor operations
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    /// Host not found in registry
    #[error("host not found: {0}")]
    HostNotFound(String),

    /// Host already exists in registry
    #[error("host already exists: {0}")]
    HostAlreadyExists(String),

    /// VM not found in registry
    #[error("vm not found: {0}")]
    VmNotFound(String),

    /// VM already exists in registry
    #[error("vm already exists: {0}")]
    VmAlreadyExists(String),

    /// Task id was never issued or has been purged
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// Probe or actuator backend failed
    #[error("backend error: {0}")]
    Backend(String),

    /// Actor communication error
    #[error("actor communication error: {0}")]
    ActorError(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Work was cancelled before it finished
    #[error("cancelled")]
    Cancelled,
}

impl CoreError {
    /// Whether this error means the requested entity does not exist
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CoreError::HostNotFound(_) | CoreError::VmNotFound(_) | CoreError::TaskNotFound(_)
        )
    }
}

/// Unwrap a handler error from an `ask`, keeping its variant
pub(crate) fn from_send_error<M>(error: SendError<M, CoreError>) -> CoreError {
    match error {
        SendError::HandlerError(error) => error,
        other => CoreError::ActorError(other.to_string()),
    }
}
