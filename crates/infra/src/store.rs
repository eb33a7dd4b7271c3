//! Errors shared by the in-process store adapters.

use thiserror::Error;

use stockwise_core::InventoryError;

/// Store operation error.
///
/// These are infrastructure failures as opposed to domain errors; callers
/// map the ones that carry business meaning (`NotFound`, `AlreadyExists`)
/// onto the domain taxonomy themselves.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),
}

impl StoreError {
    pub(crate) fn poisoned() -> Self {
        StoreError::Unavailable("lock poisoned".to_string())
    }
}

impl From<StoreError> for InventoryError {
    fn from(err: StoreError) -> Self {
        InventoryError::Storage(err.to_string())
    }
}
