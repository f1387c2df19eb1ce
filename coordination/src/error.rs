//! Error types for the handoff API
//!
//! Gate rejections are not errors: `evaluate` reports them as a typed
//! [`Decision`](crate::coordinator::Decision). These variants cover
//! administrative operations, configuration, and infrastructure failure.

use thiserror::Error;

use crate::messaging::MessagingError;
use crate::state::{ContactId, StoreError};

/// Result type alias for handoff operations
pub type HandoffResult<T> = Result<T, HandoffError>;

/// Main error type for handoff operations
#[derive(Debug, Error)]
pub enum HandoffError {
    /// No contact with this id has ever been seen
    #[error("Contact not found: {0}")]
    ContactNotFound(ContactId),

    /// Reset requested for a contact that is not under human control
    #[error("Contact {0} is not escalated")]
    NotEscalated(ContactId),

    /// Mutation requested for an archived contact
    #[error("Contact {0} is closed")]
    ContactClosed(ContactId),

    /// Another decision holds the contact lock
    #[error("Contact {0} is locked by another decision")]
    LockContended(ContactId),

    /// Storage or lock infrastructure is down
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Storage returned malformed data
    #[error("Storage error: {0}")]
    Storage(String),

    /// Scorer or messaging layer failed
    #[error(transparent)]
    Messaging(#[from] MessagingError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HandoffError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether an operator should be paged for this error
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_) | Self::Storage(_))
    }
}

impl From<StoreError> for HandoffError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => Self::BackendUnavailable(msg),
            other => Self::Storage(other.to_string()),
        }
    }
}
