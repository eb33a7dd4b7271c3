//! Inbound order-lifecycle events as published by the order service.

use serde::{Deserialize, Serialize};

use stockwise_core::{EventId, OrderId};

use crate::order::OrderItem;

/// What the inventory side does with an inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderEventKind {
    Created,
    Fulfilled,
    Cancelled,
    /// Anything else; accepted and ignored so new producers don't break us.
    Other(String),
}

impl OrderEventKind {
    pub fn parse(event_type: &str) -> Self {
        match event_type {
            "ORDER_CREATED" => OrderEventKind::Created,
            "ORDER_FULFILLED" => OrderEventKind::Fulfilled,
            "ORDER_CANCELLED" => OrderEventKind::Cancelled,
            other => OrderEventKind::Other(other.to_string()),
        }
    }
}

/// `{eventType, orderId, items: [{productId, quantity}], eventId?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEvent {
    pub event_type: String,
    pub order_id: OrderId,
    #[serde(default)]
    pub items: Vec<OrderItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
}

impl OrderEvent {
    pub fn from_json(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    pub fn kind(&self) -> OrderEventKind {
        OrderEventKind::parse(&self.event_type)
    }

    /// The id used for deduplication.
    ///
    /// Blank ids are treated as missing so they cannot collide with each other.
    pub fn effective_event_id(&self) -> EventId {
        match &self.event_id {
            Some(id) if !id.as_str().trim().is_empty() => id.clone(),
            _ => EventId::derived(&self.order_id, &self.event_type),
        }
    }
}
