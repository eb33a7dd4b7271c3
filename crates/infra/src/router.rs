//! Maps order-lifecycle events onto ledger adjustments.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use stockwise_core::{EventId, InventoryError, InventoryResult, OrderId, ProductId};
use stockwise_inventory::AdjustmentReason;
use stockwise_orders::{OrderEvent, OrderEventKind, OrderItem};

use crate::ledger::StockLedger;

/// An item the router could not apply. The rest of the event still went through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedItem {
    pub product_id: ProductId,
    pub quantity: i64,
    pub error: String,
}

/// What routing one event did.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouteReport {
    pub applied: Vec<OrderItem>,
    pub skipped: Vec<SkippedItem>,
}

impl RouteReport {
    pub fn is_partial(&self) -> bool {
        !self.skipped.is_empty()
    }
}

/// `ORDER_FULFILLED` decrements, `ORDER_CANCELLED` increments, everything else
/// is a no-op.
///
/// Per-item business failures are logged and skipped. An infrastructure
/// failure aborts the loop and is returned, so the caller can hand the event
/// back for redelivery; items applied before the abort stay applied.
pub struct EventRouter {
    ledger: Arc<StockLedger>,
}

impl EventRouter {
    pub fn new(ledger: Arc<StockLedger>) -> Self {
        Self { ledger }
    }

    pub fn route(&self, event_id: &EventId, event: &OrderEvent) -> InventoryResult<RouteReport> {
        match event.kind() {
            OrderEventKind::Fulfilled => self.apply_items(
                event_id,
                &event.order_id,
                &event.items,
                -1,
                AdjustmentReason::OrderFulfilled,
            ),
            OrderEventKind::Cancelled => self.apply_items(
                event_id,
                &event.order_id,
                &event.items,
                1,
                AdjustmentReason::OrderCancelled,
            ),
            OrderEventKind::Created => {
                info!(event_id = %event_id, order_id = %event.order_id, "order created; no stock change");
                Ok(RouteReport::default())
            }
            OrderEventKind::Other(event_type) => {
                info!(event_id = %event_id, order_id = %event.order_id, event_type = %event_type, "ignoring unknown event type");
                Ok(RouteReport::default())
            }
        }
    }

    fn apply_items(
        &self,
        event_id: &EventId,
        order_id: &OrderId,
        items: &[OrderItem],
        sign: i64,
        reason: AdjustmentReason,
    ) -> InventoryResult<RouteReport> {
        let mut report = RouteReport::default();

        for item in items {
            let result = if item.quantity <= 0 {
                Err(InventoryError::invalid_argument(format!(
                    "item quantity must be positive, got {}",
                    item.quantity
                )))
            } else {
                self.ledger
                    .adjust(item.product_id, sign * item.quantity, reason)
            };

            match result {
                Ok(_) => report.applied.push(item.clone()),
                Err(err) if err.is_retryable() => {
                    warn!(
                        event_id = %event_id,
                        order_id = %order_id,
                        product_id = %item.product_id,
                        applied = report.applied.len(),
                        error = %err,
                        "routing aborted by infrastructure failure"
                    );
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        event_id = %event_id,
                        order_id = %order_id,
                        product_id = %item.product_id,
                        quantity = item.quantity,
                        error = %err,
                        "skipping item"
                    );
                    report.skipped.push(SkippedItem {
                        product_id: item.product_id,
                        quantity: item.quantity,
                        error: err.to_string(),
                    });
                }
            }
        }

        info!(
            event_id = %event_id,
            order_id = %order_id,
            reason = %reason,
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            "order event routed"
        );
        Ok(report)
    }
}
