use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockwise_core::{Aggregate, AggregateRoot, InventoryError, ProductId};
use stockwise_events::Event;

/// Why a stock quantity changed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdjustmentReason {
    Manual,
    AutoReplenishment,
    OrderFulfilled,
    OrderCancelled,
    Compensation,
}

impl AdjustmentReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AdjustmentReason::Manual => "MANUAL",
            AdjustmentReason::AutoReplenishment => "AUTO_REPLENISHMENT",
            AdjustmentReason::OrderFulfilled => "ORDER_FULFILLED",
            AdjustmentReason::OrderCancelled => "ORDER_CANCELLED",
            AdjustmentReason::Compensation => "COMPENSATION",
        }
    }
}

impl core::fmt::Display for AdjustmentReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate root: the stock counter of one product.
///
/// Quantity is never negative. Every change goes through [`AdjustStock`] so
/// that the quantity always equals the sum of the recorded deltas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockRecord {
    product_id: ProductId,
    quantity: i64,
    min_threshold: i64,
    last_updated: DateTime<Utc>,
    version: u64,
}

impl StockRecord {
    /// A freshly registered product with no stock.
    pub fn new(product_id: ProductId, min_threshold: i64, created_at: DateTime<Utc>) -> Result<Self, InventoryError> {
        if min_threshold < 0 {
            return Err(InventoryError::invalid_argument("min threshold cannot be negative"));
        }
        Ok(Self {
            product_id,
            quantity: 0,
            min_threshold,
            last_updated: created_at,
            version: 0,
        })
    }

    pub fn product_id(&self) -> ProductId {
        self.product_id
    }

    pub fn quantity(&self) -> i64 {
        self.quantity
    }

    pub fn min_threshold(&self) -> i64 {
        self.min_threshold
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    /// Strictly below the reorder threshold.
    pub fn is_below_min_threshold(&self) -> bool {
        self.quantity < self.min_threshold
    }

    /// Threshold changes are configuration, not stock movements; they do not
    /// bump the version or touch history.
    pub fn set_min_threshold(&mut self, min_threshold: i64) -> Result<(), InventoryError> {
        if min_threshold < 0 {
            return Err(InventoryError::invalid_argument("min threshold cannot be negative"));
        }
        self.min_threshold = min_threshold;
        Ok(())
    }
}

impl AggregateRoot for StockRecord {
    type Id = ProductId;

    fn id(&self) -> &Self::Id {
        &self.product_id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: AdjustStock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustStock {
    pub product_id: ProductId,
    pub delta: i64,
    pub reason: AdjustmentReason,
    pub requested_at: DateTime<Utc>,
}

/// Event: StockAdjusted.
///
/// Also the outbound inventory-change payload published on every successful
/// adjustment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockAdjusted {
    pub product_id: ProductId,
    pub delta: i64,
    pub reason: AdjustmentReason,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub resulting_quantity: Option<i64>,
    #[serde(rename = "timestamp")]
    pub occurred_at: DateTime<Utc>,
}

impl Event for StockAdjusted {
    fn event_type(&self) -> &'static str {
        "inventory.stock_adjusted"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

impl Aggregate for StockRecord {
    type Command = AdjustStock;
    type Event = StockAdjusted;
    type Error = InventoryError;

    fn apply(&mut self, event: &Self::Event) {
        self.quantity += event.delta;
        self.last_updated = event.occurred_at;
        self.version += 1;
    }

    fn handle(&self, cmd: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        if cmd.product_id != self.product_id {
            return Err(InventoryError::invalid_argument("product_id mismatch"));
        }
        if cmd.delta == 0 {
            return Err(InventoryError::invalid_argument("delta cannot be zero"));
        }

        let new_quantity = self
            .quantity
            .checked_add(cmd.delta)
            .ok_or_else(|| InventoryError::invalid_argument("delta overflows stock quantity"))?;
        if new_quantity < 0 {
            return Err(InventoryError::InsufficientStock {
                product_id: self.product_id,
                available: self.quantity,
                requested: -cmd.delta,
            });
        }

        // History timestamps must not go backwards even if the wall clock does.
        let occurred_at = cmd.requested_at.max(self.last_updated);

        Ok(vec![StockAdjusted {
            product_id: self.product_id,
            delta: cmd.delta,
            reason: cmd.reason,
            resulting_quantity: Some(new_quantity),
            occurred_at,
        }])
    }
}

/// Append-only history entry, one per successful adjustment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustmentRecord {
    pub product_id: ProductId,
    pub delta: i64,
    pub reason: AdjustmentReason,
    pub timestamp: DateTime<Utc>,
    pub resulting_quantity: i64,
}

impl From<&StockAdjusted> for AdjustmentRecord {
    fn from(ev: &StockAdjusted) -> Self {
        Self {
            product_id: ev.product_id,
            delta: ev.delta,
            reason: ev.reason,
            timestamp: ev.occurred_at,
            resulting_quantity: ev.resulting_quantity.unwrap_or_default(),
        }
    }
}

/// Recompute a quantity from its history.
pub fn replay(history: &[AdjustmentRecord]) -> i64 {
    history.iter().map(|r| r.delta).sum()
}
