//! Applies restoration requests arriving on the compensation channel.
//!
//! Only wired when another service runs the order saga; an in-process saga
//! refunds through the ledger directly.

use std::sync::Arc;

use tracing::{error, info, warn};

use stockwise_core::{EventId, InventoryResult};
use stockwise_events::{BusMessage, DeadLetter};
use stockwise_inventory::AdjustmentReason;
use stockwise_orders::CompensationEvent;

use crate::idempotency::IdempotencyGuard;
use crate::ledger::StockLedger;
use crate::publisher::{Publisher, publish_dead_letter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompensationOutcome {
    Restored { resulting_quantity: i64 },
    Duplicate,
    Rejected { reason: String },
}

pub struct CompensationHandler {
    guard: IdempotencyGuard,
    ledger: Arc<StockLedger>,
    publisher: Arc<dyn Publisher>,
}

impl CompensationHandler {
    pub fn new(guard: IdempotencyGuard, ledger: Arc<StockLedger>, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            guard,
            ledger,
            publisher,
        }
    }

    pub fn handle(&self, message: &BusMessage) -> InventoryResult<CompensationOutcome> {
        let event: CompensationEvent = match message.decode() {
            Ok(event) => event,
            Err(err) => return Ok(self.reject(message, format!("unparseable payload: {err}"))),
        };
        if event.quantity <= 0 {
            return Ok(self.reject(
                message,
                format!("compensation quantity must be positive, got {}", event.quantity),
            ));
        }

        let dedup_key = EventId::new(format!("compensation:{}", message.message_id()));
        if !self.guard.admit(&dedup_key)? {
            return Ok(CompensationOutcome::Duplicate);
        }

        match self
            .ledger
            .adjust(event.product_id, event.quantity, AdjustmentReason::Compensation)
        {
            Ok(resulting_quantity) => {
                info!(
                    product_id = %event.product_id,
                    quantity = event.quantity,
                    resulting_quantity,
                    "compensation applied"
                );
                Ok(CompensationOutcome::Restored { resulting_quantity })
            }
            Err(err) if err.is_retryable() => {
                if let Err(release_err) = self.guard.release(&dedup_key) {
                    error!(key = %dedup_key, error = %release_err, "failed to release compensation");
                }
                Err(err)
            }
            Err(err) => Ok(self.reject(message, err.to_string())),
        }
    }

    fn reject(&self, message: &BusMessage, reason: String) -> CompensationOutcome {
        warn!(message_id = %message.message_id(), reason = %reason, "compensation rejected");
        if let Err(err) = publish_dead_letter(self.publisher.as_ref(), DeadLetter::new(message, reason.clone(), 1)) {
            error!(error = %err, "failed to record dead letter");
        }
        CompensationOutcome::Rejected { reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::InMemoryProcessedEventStore;
    use crate::ledger::InMemoryLedgerStore;
    use crate::publisher::OutboxPublisher;
    use stockwise_core::ProductId;
    use stockwise_events::{EventBus, InMemoryEventBus, Subscription, channels};

    fn setup() -> (CompensationHandler, Arc<StockLedger>, Subscription<BusMessage>) {
        let bus = Arc::new(InMemoryEventBus::<BusMessage>::new());
        let tap = bus.subscribe();
        let outbox: Arc<dyn Publisher> = Arc::new(OutboxPublisher::new(bus));
        let ledger = Arc::new(StockLedger::new(
            Arc::new(InMemoryLedgerStore::new()),
            Arc::clone(&outbox),
        ));
        let guard = IdempotencyGuard::new(Arc::new(InMemoryProcessedEventStore::new()));
        (
            CompensationHandler::new(guard, Arc::clone(&ledger), outbox),
            ledger,
            tap,
        )
    }

    fn request(product_id: ProductId, quantity: i64) -> BusMessage {
        BusMessage::raw(
            channels::INVENTORY_COMPENSATION,
            Some(product_id.to_string()),
            format!(r#"{{"orderId":"7","productId":"{product_id}","quantity":{quantity}}}"#),
        )
    }

    #[test]
    fn restores_stock_once_per_message() {
        let (handler, ledger, _) = setup();
        let p = ProductId::new();
        ledger.register_product(p, 0, 2).unwrap();
        let msg = request(p, 3);

        assert_eq!(
            handler.handle(&msg).unwrap(),
            CompensationOutcome::Restored { resulting_quantity: 5 }
        );
        assert_eq!(handler.handle(&msg).unwrap(), CompensationOutcome::Duplicate);
        assert_eq!(ledger.get_quantity(p).unwrap(), 5);
        assert_eq!(
            ledger.history(p).unwrap().last().unwrap().reason,
            AdjustmentReason::Compensation
        );
    }

    #[test]
    fn unknown_product_is_dead_lettered() {
        let (handler, _, tap) = setup();

        let outcome = handler.handle(&request(ProductId::new(), 1)).unwrap();

        assert!(matches!(outcome, CompensationOutcome::Rejected { .. }));
        assert!(tap.drain().iter().any(|m| m.channel() == channels::DEAD_LETTER));
    }

    #[test]
    fn non_positive_quantity_is_rejected() {
        let (handler, ledger, _) = setup();
        let p = ProductId::new();
        ledger.register_product(p, 0, 2).unwrap();

        let outcome = handler.handle(&request(p, 0)).unwrap();

        assert!(matches!(outcome, CompensationOutcome::Rejected { .. }));
        assert_eq!(ledger.get_quantity(p).unwrap(), 2);
    }
}
