//! Domain error model.

use thiserror::Error;

use crate::id::{OrderId, ProductId};

/// Result type used across the inventory services.
pub type InventoryResult<T> = Result<T, InventoryError>;

/// Error taxonomy for ledger, guard, saga and replenishment operations.
///
/// Business failures (not found, insufficient stock, validation) are terminal
/// for the single call that raised them and never leave partial state behind.
/// `GuardUnavailable` and `Storage` are infrastructure failures: the caller
/// retries the whole unit of work later.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InventoryError {
    #[error("product not found: {0}")]
    ProductNotFound(ProductId),

    #[error("product already exists: {0}")]
    ProductAlreadyExists(ProductId),

    #[error("insufficient stock for {product_id}: available {available}, requested {requested}")]
    InsufficientStock {
        product_id: ProductId,
        available: i64,
        requested: i64,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The processed-event store could not be reached; the event must be retried.
    #[error("idempotency guard unavailable: {0}")]
    GuardUnavailable(String),

    #[error("order not found: {0}")]
    OrderNotFound(OrderId),

    #[error("reservation failed for order {order_id}: {reason}")]
    ReservationFailed { order_id: OrderId, reason: String },

    #[error("compensation already applied for order {0}")]
    CompensationAlreadyApplied(OrderId),

    /// Recovered locally by the replenishment fallback; never surfaced to callers.
    #[error("demand estimator unavailable: {0}")]
    EstimatorUnavailable(String),

    #[error("invalid order transition for {order_id}: {from} -> {to}")]
    InvalidTransition {
        order_id: OrderId,
        from: String,
        to: String,
    },

    #[error("history replay mismatch for {product_id}: stored {stored}, replayed {replayed}")]
    ReplayMismatch {
        product_id: ProductId,
        stored: i64,
        replayed: i64,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

/// Coarse classification used by API layers and retry loops.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Validation,
    Unavailable,
    Internal,
}

impl ErrorKind {
    /// HTTP-style status code for this kind.
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Validation => 400,
            ErrorKind::Unavailable => 503,
            ErrorKind::Internal => 500,
        }
    }
}

impl InventoryError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn guard_unavailable(msg: impl Into<String>) -> Self {
        Self::GuardUnavailable(msg.into())
    }

    pub fn reservation_failed(order_id: OrderId, reason: impl Into<String>) -> Self {
        Self::ReservationFailed {
            order_id,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            InventoryError::ProductNotFound(_) | InventoryError::OrderNotFound(_) => {
                ErrorKind::NotFound
            }
            InventoryError::ProductAlreadyExists(_)
            | InventoryError::InsufficientStock { .. }
            | InventoryError::ReservationFailed { .. }
            | InventoryError::CompensationAlreadyApplied(_)
            | InventoryError::InvalidTransition { .. } => ErrorKind::Conflict,
            InventoryError::InvalidArgument(_) => ErrorKind::Validation,
            InventoryError::GuardUnavailable(_)
            | InventoryError::EstimatorUnavailable(_)
            | InventoryError::Storage(_) => ErrorKind::Unavailable,
            InventoryError::ReplayMismatch { .. } => ErrorKind::Internal,
        }
    }

    /// True when the failure is transient infrastructure and the unit of work
    /// should be replayed later rather than skipped.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn business_errors_are_not_retryable() {
        let product_id = ProductId::new();
        let errors = [
            InventoryError::ProductNotFound(product_id),
            InventoryError::InsufficientStock {
                product_id,
                available: 1,
                requested: 2,
            },
            InventoryError::invalid_argument("delta cannot be zero"),
        ];

        for err in errors {
            assert!(!err.is_retryable(), "{err} should be terminal");
        }
    }

    #[test]
    fn infrastructure_errors_are_retryable() {
        assert!(InventoryError::guard_unavailable("down").is_retryable());
        assert!(InventoryError::storage("down").is_retryable());
    }

    #[test]
    fn kinds_map_to_distinct_status_codes() {
        let product_id = ProductId::new();
        assert_eq!(InventoryError::ProductNotFound(product_id).kind().status_code(), 404);
        assert_eq!(
            InventoryError::InsufficientStock {
                product_id,
                available: 0,
                requested: 1
            }
            .kind()
            .status_code(),
            409
        );
        assert_eq!(InventoryError::invalid_argument("x").kind().status_code(), 400);
        assert_eq!(InventoryError::storage("x").kind().status_code(), 503);
    }
}
