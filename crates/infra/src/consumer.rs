//! Inbound pipeline for the order-events channel: parse, dedupe, route.

use std::sync::Arc;

use serde_json::json;
use tracing::{error, info, warn};

use stockwise_core::{EventId, InventoryResult};
use stockwise_events::{BusMessage, DeadLetter};
use stockwise_orders::OrderEvent;

use crate::idempotency::IdempotencyGuard;
use crate::publisher::{Publisher, publish_dead_letter};
use crate::router::{EventRouter, RouteReport};

/// Result of handling one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Routed { event_id: EventId, report: RouteReport },
    Duplicate(EventId),
    /// The payload could not be parsed; it went to the dead-letter channel.
    Unparseable,
}

pub struct OrderEventConsumer {
    guard: IdempotencyGuard,
    router: EventRouter,
    publisher: Arc<dyn Publisher>,
}

impl OrderEventConsumer {
    pub fn new(guard: IdempotencyGuard, router: EventRouter, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            guard,
            router,
            publisher,
        }
    }

    /// Handle one raw delivery.
    ///
    /// Errors are always retryable infrastructure failures; when one is
    /// returned the event id has been released and a redelivery will be
    /// processed from the start.
    pub fn handle(&self, message: &BusMessage) -> InventoryResult<ConsumeOutcome> {
        let event = match OrderEvent::from_json(message.payload()) {
            Ok(event) => event,
            Err(err) => {
                warn!(
                    message_id = %message.message_id(),
                    error = %err,
                    "unparseable order event; dead-lettering"
                );
                self.dead_letter(DeadLetter::new(message, format!("unparseable payload: {err}"), 1));
                return Ok(ConsumeOutcome::Unparseable);
            }
        };

        let event_id = event.effective_event_id();
        if !self.guard.admit(&event_id)? {
            return Ok(ConsumeOutcome::Duplicate(event_id));
        }

        match self.router.route(&event_id, &event) {
            Ok(report) => {
                if report.is_partial() {
                    self.dead_letter_partial(message, &event_id, &report);
                }
                Ok(ConsumeOutcome::Routed { event_id, report })
            }
            Err(err) => {
                if let Err(release_err) = self.guard.release(&event_id) {
                    // Redelivery will now be dropped as a duplicate.
                    error!(
                        event_id = %event_id,
                        error = %release_err,
                        "failed to release event after routing failure"
                    );
                }
                Err(err)
            }
        }
    }

    fn dead_letter_partial(&self, message: &BusMessage, event_id: &EventId, report: &RouteReport) {
        let reason = json!({
            "error": "items skipped during routing",
            "skipped": report.skipped,
            "appliedCount": report.applied.len(),
        })
        .to_string();

        let mut dead_letter = DeadLetter::new(message, reason, 1);
        dead_letter.key = Some(event_id.to_string());
        info!(event_id = %event_id, skipped = report.skipped.len(), "recording partial completion");
        self.dead_letter(dead_letter);
    }

    fn dead_letter(&self, dead_letter: DeadLetter) {
        if let Err(err) = publish_dead_letter(self.publisher.as_ref(), dead_letter) {
            error!(error = %err, "failed to record dead letter");
        }
    }
}
