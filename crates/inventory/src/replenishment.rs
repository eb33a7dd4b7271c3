//! Replenishment orders and the reorder quantity rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockwise_core::{InventoryError, ProductId, ReplenishmentOrderId};
use stockwise_events::Event;

use crate::stock::StockRecord;

/// Multiplier applied to the demand forecast before netting off current stock.
pub const DEFAULT_SAFETY_FACTOR: f64 = 1.2;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplenishmentStatus {
    Pending,
    Sent,
}

/// A reorder request sent to a supplier.
///
/// Created `Pending`; becomes `Sent` (terminal) once its event is published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplenishmentOrder {
    id: ReplenishmentOrderId,
    product_id: ProductId,
    quantity: i64,
    status: ReplenishmentStatus,
    created_at: DateTime<Utc>,
}

impl ReplenishmentOrder {
    pub fn new(product_id: ProductId, quantity: i64, created_at: DateTime<Utc>) -> Result<Self, InventoryError> {
        if quantity <= 0 {
            return Err(InventoryError::invalid_argument("replenishment quantity must be positive"));
        }
        Ok(Self {
            id: ReplenishmentOrderId::new(),
            product_id,
            quantity,
            status: ReplenishmentStatus::Pending,
            created_at,
        })
    }

    pub fn id(&self) -> ReplenishmentOrderId {
        self.id
    }

    pub fn product_id(&self) -> ProductId {
        self.product_id
    }

    pub fn quantity(&self) -> i64 {
        self.quantity
    }

    pub fn status(&self) -> ReplenishmentStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn mark_sent(&mut self) -> Result<(), InventoryError> {
        match self.status {
            ReplenishmentStatus::Pending => {
                self.status = ReplenishmentStatus::Sent;
                Ok(())
            }
            ReplenishmentStatus::Sent => Err(InventoryError::invalid_argument(format!(
                "replenishment order {} already sent",
                self.id
            ))),
        }
    }

    pub fn to_event(&self) -> ReplenishmentEvent {
        ReplenishmentEvent {
            order_id: self.id,
            product_id: self.product_id,
            quantity: self.quantity,
            status: self.status,
            occurred_at: self.created_at,
        }
    }
}

/// Outbound replenishment payload: `{orderId, productId, quantity, status}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplenishmentEvent {
    pub order_id: ReplenishmentOrderId,
    pub product_id: ProductId,
    pub quantity: i64,
    pub status: ReplenishmentStatus,
    #[serde(skip)]
    pub occurred_at: DateTime<Utc>,
}

impl Event for ReplenishmentEvent {
    fn event_type(&self) -> &'static str {
        "inventory.replenishment_ordered"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

/// Where a plan's demand figure came from.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ForecastSource {
    Estimator { prediction: f64 },
    /// Estimator failed or timed out.
    Fallback,
}

/// Reorder decision for one low-stock product.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplenishmentPlan {
    pub product_id: ProductId,
    pub current_quantity: i64,
    pub min_threshold: i64,
    pub source: ForecastSource,
    pub required: i64,
}

impl ReplenishmentPlan {
    pub fn for_record(record: &StockRecord, source: ForecastSource, safety_factor: f64) -> Self {
        let required = match source {
            ForecastSource::Estimator { prediction } => {
                required_quantity(prediction, safety_factor, record.quantity())
            }
            ForecastSource::Fallback => fallback_quantity(record),
        };
        Self {
            product_id: record.product_id(),
            current_quantity: record.quantity(),
            min_threshold: record.min_threshold(),
            source,
            required,
        }
    }

    pub fn needs_order(&self) -> bool {
        self.required > 0
    }
}

/// `max(0, ceil(forecast * safety_factor) - quantity)`.
///
/// Non-finite forecasts count as zero demand.
pub fn required_quantity(forecast: f64, safety_factor: f64, quantity: i64) -> i64 {
    let target = forecast * safety_factor;
    if !target.is_finite() {
        return 0;
    }
    // `as` saturates, so absurd forecasts clamp instead of wrapping.
    let target = target.ceil() as i64;
    target.saturating_sub(quantity).max(0)
}

/// Heuristic used when no forecast is available: top up to the threshold.
pub fn fallback_quantity(record: &StockRecord) -> i64 {
    record
        .min_threshold()
        .saturating_sub(record.quantity())
        .max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stock::{AdjustStock, AdjustmentReason};
    use stockwise_core::execute;

    fn record(quantity: i64, min_threshold: i64) -> StockRecord {
        let product_id = ProductId::new();
        let mut r = StockRecord::new(product_id, min_threshold, Utc::now()).unwrap();
        if quantity > 0 {
            let cmd = AdjustStock {
                product_id,
                delta: quantity,
                reason: AdjustmentReason::Manual,
                requested_at: Utc::now(),
            };
            execute(&mut r, &cmd).unwrap();
        }
        r
    }

    #[test]
    fn forecast_is_padded_by_safety_factor_and_netted() {
        assert_eq!(required_quantity(20.0, DEFAULT_SAFETY_FACTOR, 4), 20);
        assert_eq!(required_quantity(8.4, DEFAULT_SAFETY_FACTOR, 0), 11);
        assert_eq!(required_quantity(5.0, DEFAULT_SAFETY_FACTOR, 10), 0);
        assert_eq!(required_quantity(f64::NAN, DEFAULT_SAFETY_FACTOR, 0), 0);
    }

    #[test]
    fn fallback_tops_up_to_threshold_without_padding() {
        let r = record(3, 10);
        let plan = ReplenishmentPlan::for_record(&r, ForecastSource::Fallback, DEFAULT_SAFETY_FACTOR);

        assert_eq!(plan.required, 7);
        assert!(plan.needs_order());
        assert_eq!(fallback_quantity(&record(12, 10)), 0);
    }

    #[test]
    fn orders_are_sent_exactly_once() {
        let mut order = ReplenishmentOrder::new(ProductId::new(), 5, Utc::now()).unwrap();
        assert_eq!(order.status(), ReplenishmentStatus::Pending);

        order.mark_sent().unwrap();
        assert_eq!(order.status(), ReplenishmentStatus::Sent);
        assert!(order.mark_sent().is_err());
    }

    #[test]
    fn zero_quantity_orders_are_rejected() {
        assert!(ReplenishmentOrder::new(ProductId::new(), 0, Utc::now()).is_err());
    }

    #[test]
    fn replenishment_payload_shape() {
        let order = ReplenishmentOrder::new(ProductId::new(), 9, Utc::now()).unwrap();
        let json = serde_json::to_value(order.to_event()).unwrap();

        assert_eq!(json["quantity"], 9);
        assert_eq!(json["status"], "PENDING");
        assert!(json.get("orderId").is_some());
        assert!(json.get("productId").is_some());
    }
}
