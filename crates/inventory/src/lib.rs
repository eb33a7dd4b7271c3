//! Inventory domain module.
//!
//! Business rules for stock records and replenishment, implemented purely as
//! deterministic domain logic (no IO, no locking, no storage).

pub mod replenishment;
pub mod stock;

pub use replenishment::{
    ForecastSource, ReplenishmentEvent, ReplenishmentOrder, ReplenishmentPlan, ReplenishmentStatus,
    DEFAULT_SAFETY_FACTOR, fallback_quantity, required_quantity,
};
pub use stock::{AdjustStock, AdjustmentReason, AdjustmentRecord, StockAdjusted, StockRecord, replay};
