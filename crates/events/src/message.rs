//! Wire unit carried by the bus.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::event::Event;

/// Channel names shared by producers and consumers.
pub mod channels {
    /// Inbound order lifecycle events.
    pub const ORDER_EVENTS: &str = "order-events";
    /// Every successful ledger adjustment.
    pub const INVENTORY_EVENTS: &str = "inventory-events";
    /// Item restoration requests emitted by saga compensation.
    pub const INVENTORY_COMPENSATION: &str = "inventory-compensation";
    /// Replenishment orders sent to suppliers.
    pub const REPLENISHMENT_ORDERS: &str = "replenishment-orders";
    /// Messages that could not be processed.
    pub const DEAD_LETTER: &str = "inventory-dlq";
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("failed to encode payload: {0}")]
    Encode(String),
    #[error("failed to decode payload: {0}")]
    Decode(String),
}

/// A message on a named channel.
///
/// `key` is the partitioning key (product or order id). The payload is kept as
/// raw JSON so consumers can dead-letter messages they cannot parse without
/// losing the original bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusMessage {
    message_id: Uuid,
    channel: String,
    key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    event_type: Option<String>,
    payload: String,
    created_at: DateTime<Utc>,
}

impl BusMessage {
    /// Wrap a raw payload as-is.
    pub fn raw(channel: impl Into<String>, key: Option<String>, payload: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::now_v7(),
            channel: channel.into(),
            key,
            event_type: None,
            payload: payload.into(),
            created_at: Utc::now(),
        }
    }

    /// Serialize `value` as the JSON payload.
    pub fn json<T: Serialize>(
        channel: impl Into<String>,
        key: Option<String>,
        value: &T,
    ) -> Result<Self, MessageError> {
        let payload = serde_json::to_string(value).map_err(|e| MessageError::Encode(e.to_string()))?;
        Ok(Self::raw(channel, key, payload))
    }

    /// Serialize a domain event, tagging the message with its event type.
    pub fn from_event<E>(channel: impl Into<String>, key: Option<String>, event: &E) -> Result<Self, MessageError>
    where
        E: Event + Serialize,
    {
        let mut message = Self::json(channel, key, event)?;
        message.event_type = Some(event.event_type().to_string());
        Ok(message)
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn event_type(&self) -> Option<&str> {
        self.event_type.as_deref()
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, MessageError> {
        serde_json::from_str(&self.payload).map_err(|e| MessageError::Decode(e.to_string()))
    }
}

/// Record of a message that exhausted processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub original_channel: String,
    pub key: Option<String>,
    pub payload: String,
    pub reason: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(original: &BusMessage, reason: impl Into<String>, attempts: u32) -> Self {
        Self {
            original_channel: original.channel().to_string(),
            key: original.key().map(str::to_string),
            payload: original.payload().to_string(),
            reason: reason.into(),
            attempts,
            failed_at: Utc::now(),
        }
    }

    /// Message for the dead-letter channel, keyed like the original.
    pub fn into_message(self) -> Result<BusMessage, MessageError> {
        let key = self.key.clone();
        BusMessage::json(channels::DEAD_LETTER, key, &self)
    }
}
