//! `stockwise-ai`
//!
//! **Responsibility:** demand-estimation boundary for replenishment.
//!
//! This crate is not part of the domain model:
//! - It must not depend on the inventory or order aggregates.
//! - It must not mutate stock.
//! - It returns forecasts, never domain events.

pub mod estimator;
pub mod moving_average;
pub mod result;

pub use estimator::{DemandEstimator, TimeoutEstimator};
pub use moving_average::{MovingAverageEstimator, SalesHistory};
pub use result::{AiError, DemandForecast};
