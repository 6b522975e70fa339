//! Common error types for the flash pipeline domain

use thiserror::Error;

use crate::models::FlashStatus;

/// Result type for collaborator calls
pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

/// Errors returned by remote collaborators (job tracker, catalog, safety gate)
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// Collaborator could not be reached
    #[error("Collaborator unreachable: {0}")]
    Unreachable(String),

    /// Collaborator answered with an error status
    #[error("Collaborator error {status}: {message}")]
    Remote { status: u16, message: String },

    /// Requested record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Response could not be parsed
    #[error("Invalid collaborator response: {0}")]
    InvalidResponse(String),
}

impl CollaboratorError {
    /// Create a remote error from status code and message
    pub fn remote(status: u16, message: impl Into<String>) -> Self {
        Self::Remote {
            status,
            message: message.into(),
        }
    }
}

/// Errors raised by the local flash job state machine
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// The requested transition is not part of the lifecycle
    #[error("Invalid flash job transition: {from} -> {to}")]
    InvalidTransition { from: FlashStatus, to: FlashStatus },
}
