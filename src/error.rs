//! Error types surfaced by the drone service

use crate::store::StoreError;
use skyfleet_shared::{AuditError, InvalidTransition, ValidationError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DroneError>;

#[derive(Debug, Error)]
pub enum DroneError {
    #[error("Drone {0} not found")]
    NotFound(i64),

    #[error("Connection attempt already in progress for drone {0}")]
    AlreadyInProgress(i64),

    #[error("No live link for drone {0}")]
    LinkUnavailable(i64),

    #[error("Link operation timed out after {0} ms")]
    LinkTimeout(u64),

    #[error("Link failure: {0}")]
    LinkFailure(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

impl From<ValidationError> for DroneError {
    fn from(e: ValidationError) -> Self {
        DroneError::Validation(e.0)
    }
}

impl From<AuditError> for DroneError {
    fn from(e: AuditError) -> Self {
        DroneError::Persistence(StoreError::Constraint(e.to_string()))
    }
}

impl DroneError {
    /// Whether the failure left durable state untouched
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            DroneError::NotFound(_)
                | DroneError::AlreadyInProgress(_)
                | DroneError::InvalidTransition(_)
                | DroneError::Validation(_)
        )
    }
}
