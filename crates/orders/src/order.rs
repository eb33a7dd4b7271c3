use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockwise_core::{Aggregate, AggregateRoot, InventoryError, OrderId, ProductId};
use stockwise_events::Event;

/// Order status lifecycle as driven by the saga.
///
/// ```text
/// CREATED -> CONFIRMED -> FULFILLED
///    |           \-> CANCELLED
///    |-> COMPENSATION_PENDING -> COMPENSATED
///    \-> COMPENSATED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Created,
    Confirmed,
    Fulfilled,
    Cancelled,
    /// Compensation started but at least one refund has not gone through yet.
    CompensationPending,
    Compensated,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Created => "CREATED",
            OrderStatus::Confirmed => "CONFIRMED",
            OrderStatus::Fulfilled => "FULFILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::CompensationPending => "COMPENSATION_PENDING",
            OrderStatus::Compensated => "COMPENSATED",
        }
    }

    /// Event type announced when an order enters this status.
    pub fn event_type(self) -> &'static str {
        match self {
            OrderStatus::Created => "ORDER_CREATED",
            OrderStatus::Confirmed => "ORDER_CONFIRMED",
            OrderStatus::Fulfilled => "ORDER_FULFILLED",
            OrderStatus::Cancelled => "ORDER_CANCELLED",
            OrderStatus::CompensationPending => "ORDER_COMPENSATION_PENDING",
            OrderStatus::Compensated => "ORDER_COMPENSATED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Fulfilled | OrderStatus::Cancelled | OrderStatus::Compensated
        )
    }

    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Created, Confirmed)
                | (Created, Cancelled)
                | (Created, CompensationPending)
                | (Created, Compensated)
                | (Confirmed, Fulfilled)
                | (Confirmed, Cancelled)
                | (Confirmed, CompensationPending)
                | (Confirmed, Compensated)
                | (CompensationPending, Compensated)
        )
    }
}

impl core::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub product_id: ProductId,
    pub quantity: i64,
}

impl OrderItem {
    pub fn new(product_id: ProductId, quantity: i64) -> Self {
        Self {
            product_id,
            quantity,
        }
    }
}

/// Aggregate root: Order.
///
/// Items are fixed at creation; only `status` evolves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    id: OrderId,
    status: OrderStatus,
    items: Vec<OrderItem>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: u64,
}

impl Order {
    /// Create an order in `CREATED`, returning the announcement event.
    pub fn create(
        id: OrderId,
        items: Vec<OrderItem>,
        created_at: DateTime<Utc>,
    ) -> Result<(Self, OrderStateChanged), InventoryError> {
        if items.is_empty() {
            return Err(InventoryError::invalid_argument("order must have at least one item"));
        }
        if let Some(item) = items.iter().find(|i| i.quantity <= 0) {
            return Err(InventoryError::invalid_argument(format!(
                "quantity for {} must be positive",
                item.product_id
            )));
        }

        let order = Self {
            id,
            status: OrderStatus::Created,
            items,
            created_at,
            updated_at: created_at,
            version: 1,
        };
        let event = OrderStateChanged::new(&order, None, OrderStatus::Created, created_at);
        Ok((order, event))
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn items(&self) -> &[OrderItem] {
        &self.items
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

impl AggregateRoot for Order {
    type Id = OrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: ChangeStatus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeStatus {
    pub order_id: OrderId,
    pub to: OrderStatus,
    pub requested_at: DateTime<Utc>,
}

/// Event: the order moved into `status`.
///
/// Published on the order-events channel as
/// `{eventType, orderId, items, previousStatus?, status, timestamp}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStateChanged {
    pub event_type: String,
    pub order_id: OrderId,
    pub items: Vec<OrderItem>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub previous_status: Option<OrderStatus>,
    pub status: OrderStatus,
    #[serde(rename = "timestamp")]
    pub occurred_at: DateTime<Utc>,
}

impl OrderStateChanged {
    fn new(
        order: &Order,
        previous_status: Option<OrderStatus>,
        status: OrderStatus,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type: status.event_type().to_string(),
            order_id: order.id.clone(),
            items: order.items.clone(),
            previous_status,
            status,
            occurred_at,
        }
    }
}

impl Event for OrderStateChanged {
    fn event_type(&self) -> &'static str {
        self.status.event_type()
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

/// Request to restore one item's stock, emitted per reserved item when an
/// order is compensated. Wire shape: `{productId, quantity}` plus the order id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationEvent {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub order_id: Option<OrderId>,
    pub product_id: ProductId,
    pub quantity: i64,
    #[serde(skip, default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
}

impl Event for CompensationEvent {
    fn event_type(&self) -> &'static str {
        "inventory.compensation_requested"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

impl Aggregate for Order {
    type Command = ChangeStatus;
    type Event = OrderStateChanged;
    type Error = InventoryError;

    fn apply(&mut self, event: &Self::Event) {
        self.status = event.status;
        self.updated_at = event.occurred_at;
        self.version += 1;
    }

    fn handle(&self, cmd: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        if cmd.order_id != self.id {
            return Err(InventoryError::invalid_argument("order_id mismatch"));
        }
        if self.status == OrderStatus::Compensated && cmd.to == OrderStatus::Compensated {
            return Err(InventoryError::CompensationAlreadyApplied(self.id.clone()));
        }
        if !self.status.can_transition_to(cmd.to) {
            return Err(InventoryError::InvalidTransition {
                order_id: self.id.clone(),
                from: self.status.to_string(),
                to: cmd.to.to_string(),
            });
        }

        let at = cmd.requested_at.max(self.updated_at);
        Ok(vec![OrderStateChanged::new(self, Some(self.status), cmd.to, at)])
    }
}
