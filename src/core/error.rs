use thiserror::Error;

use crate::core::types::RecordId;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Entity kind '{0}' not found in schema")]
    KindNotFound(String),

    #[error("Record '{0}' not found")]
    RecordNotFound(RecordId),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Persistence failed: {0}")]
    PersistenceFailed(String),

    #[error("Lock error: {0}")]
    LockPoisoned(String),

    #[error("Operation requires the main thread")]
    NotMainThread,
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockPoisoned(err.to_string())
    }
}
