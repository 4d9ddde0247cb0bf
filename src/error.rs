use std::time::Duration;

use crate::cloud::CloudError;
use crate::lock::LockError;
use crate::policy::PolicyError;

/// Outcome classes of a broker operation.
///
/// The adapter maps `NotFound` to "gone", `Validation` to a bad request and
/// everything else to an unexpected failure.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("{0}")]
    NotFound(String),

    #[error("invalid parameters: {0}")]
    Validation(String),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("failed to lock service instance: {0}")]
    Lock(#[from] LockError),

    #[error("operation did not complete within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BrokerError {
    pub fn not_found(message: impl Into<String>) -> Self {
        BrokerError::NotFound(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        BrokerError::Validation(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BrokerError::NotFound(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, BrokerError::Validation(_))
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;
