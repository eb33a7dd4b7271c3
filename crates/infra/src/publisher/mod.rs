//! Outbound side: everything the services emit goes through a [`Publisher`].

pub mod outbox;

use serde::Serialize;
use thiserror::Error;

use stockwise_events::{BusMessage, DeadLetter, Event};

pub use outbox::{FlushReport, OutboxEntry, OutboxPublisher};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("failed to encode message: {0}")]
    Encode(String),

    /// The message could not even be recorded for later delivery.
    #[error("outbox unavailable: {0}")]
    Outbox(String),
}

/// Accepts messages for at-least-once delivery.
///
/// `Ok` means the message is recorded and will reach the bus eventually; it
/// does not mean the bus has already seen it.
pub trait Publisher: Send + Sync {
    fn publish(&self, message: BusMessage) -> Result<(), PublishError>;
}

/// Serialize a domain event and hand it to `publisher`.
pub fn publish_event<E>(
    publisher: &dyn Publisher,
    channel: &str,
    key: Option<String>,
    event: &E,
) -> Result<(), PublishError>
where
    E: Event + Serialize,
{
    let message = BusMessage::from_event(channel, key, event)
        .map_err(|e| PublishError::Encode(e.to_string()))?;
    publisher.publish(message)
}

/// Forward a dead letter to the dead-letter channel.
pub fn publish_dead_letter(publisher: &dyn Publisher, dead_letter: DeadLetter) -> Result<(), PublishError> {
    let message = dead_letter
        .into_message()
        .map_err(|e| PublishError::Encode(e.to_string()))?;
    publisher.publish(message)
}
