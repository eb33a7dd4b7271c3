use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use stockwise_events::{BusMessage, EventBus};

use super::{PublishError, Publisher};

/// A message waiting for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub message: BusMessage,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl OutboxEntry {
    pub fn id(&self) -> Uuid {
        self.message.message_id()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub published: usize,
    pub pending: usize,
}

#[derive(Debug, Default)]
struct OutboxState {
    pending: VecDeque<OutboxEntry>,
    published_total: u64,
}

/// Outbox in front of a bus.
///
/// Every message is recorded first and then delivered in recording order.
/// When the bus refuses a message, it and everything behind it stay pending
/// (so per-key ordering survives an outage) until [`flush_pending`] succeeds.
///
/// [`flush_pending`]: OutboxPublisher::flush_pending
#[derive(Debug)]
pub struct OutboxPublisher<B> {
    bus: B,
    state: Mutex<OutboxState>,
}

impl<B> OutboxPublisher<B>
where
    B: EventBus<BusMessage>,
{
    pub fn new(bus: B) -> Self {
        Self {
            bus,
            state: Mutex::new(OutboxState::default()),
        }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Deliver pending messages in order, stopping at the first refusal.
    pub fn flush_pending(&self) -> Result<FlushReport, PublishError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| PublishError::Outbox("outbox lock poisoned".to_string()))?;
        Ok(self.flush_locked(&mut state))
    }

    pub fn pending(&self) -> Vec<OutboxEntry> {
        self.state
            .lock()
            .map(|s| s.pending.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().map(|s| s.pending.len()).unwrap_or(0)
    }

    pub fn published_total(&self) -> u64 {
        self.state.lock().map(|s| s.published_total).unwrap_or(0)
    }

    fn flush_locked(&self, state: &mut OutboxState) -> FlushReport {
        let mut published = 0;

        while let Some(entry) = state.pending.front_mut() {
            entry.attempts += 1;
            match self.bus.publish(entry.message.clone()) {
                Ok(()) => {
                    tracing::debug!(
                        message_id = %entry.id(),
                        channel = entry.message.channel(),
                        "outbox message published"
                    );
                    state.pending.pop_front();
                    state.published_total += 1;
                    published += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        message_id = %entry.id(),
                        channel = entry.message.channel(),
                        attempts = entry.attempts,
                        error = %err,
                        "bus refused outbox message; keeping it pending"
                    );
                    entry.last_error = Some(err.to_string());
                    break;
                }
            }
        }

        FlushReport {
            published,
            pending: state.pending.len(),
        }
    }
}

impl<B> Publisher for OutboxPublisher<B>
where
    B: EventBus<BusMessage>,
{
    fn publish(&self, message: BusMessage) -> Result<(), PublishError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| PublishError::Outbox("outbox lock poisoned".to_string()))?;

        state.pending.push_back(OutboxEntry {
            message,
            attempts: 0,
            last_error: None,
            recorded_at: Utc::now(),
        });
        self.flush_locked(&mut state);
        Ok(())
    }
}
