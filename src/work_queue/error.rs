//! Work queue error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Job not found: {0}")]
    NotFound(String),
    #[error("Job {0} is active and locked by a worker")]
    Locked(String),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("{0}")]
    Other(String),
}

impl From<diesel::result::Error> for QueueError {
    fn from(e: diesel::result::Error) -> Self {
        QueueError::Database(e.to_string())
    }
}

impl From<crate::repository::StoreError> for QueueError {
    fn from(e: crate::repository::StoreError) -> Self {
        QueueError::Connection(e.to_string())
    }
}
