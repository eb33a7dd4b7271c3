//! Taking and giving back stock on behalf of an order.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use tracing::{error, warn};

use stockwise_core::{InventoryError, InventoryResult, OrderId};
use stockwise_inventory::AdjustmentReason;
use stockwise_orders::OrderItem;

use crate::ledger::StockLedger;

/// Why a reservation did not go through, and what it left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationFailure {
    pub error: InventoryError,
    /// Items that were decremented before the failure.
    pub reserved: Vec<OrderItem>,
    /// Decremented items the rollback could not give back.
    pub held: Vec<OrderItem>,
}

impl ReservationFailure {
    fn nothing_taken(error: InventoryError) -> Self {
        Self {
            error,
            reserved: Vec::new(),
            held: Vec::new(),
        }
    }
}

pub trait StockReservation: Send + Sync {
    /// Decrement every item or none. On failure, items already taken are
    /// rolled back before returning.
    fn reserve(&self, order_id: &OrderId, items: &[OrderItem]) -> Result<(), ReservationFailure>;

    /// Give one item's stock back.
    fn release(&self, order_id: &OrderId, item: &OrderItem) -> InventoryResult<()>;

    /// Retry releases that failed with no order left to track them.
    fn release_stranded(&self) -> StrandedRelease {
        StrandedRelease::default()
    }
}

/// Result of [`StockReservation::release_stranded`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StrandedRelease {
    pub returned: usize,
    pub still_stranded: usize,
}

/// Reserves directly against the in-process ledger.
pub struct LedgerReservation {
    ledger: Arc<StockLedger>,
}

impl LedgerReservation {
    pub fn new(ledger: Arc<StockLedger>) -> Self {
        Self { ledger }
    }
}

impl StockReservation for LedgerReservation {
    fn reserve(&self, order_id: &OrderId, items: &[OrderItem]) -> Result<(), ReservationFailure> {
        let mut reserved: Vec<OrderItem> = Vec::with_capacity(items.len());

        for item in items {
            if let Err(error) = self
                .ledger
                .adjust(item.product_id, -item.quantity, AdjustmentReason::OrderFulfilled)
            {
                warn!(
                    order_id = %order_id,
                    product_id = %item.product_id,
                    quantity = item.quantity,
                    error = %error,
                    rolled_back = reserved.len(),
                    "reservation failed; rolling back"
                );
                let held = reserved
                    .iter()
                    .filter(|taken| self.release(order_id, taken).is_err())
                    .cloned()
                    .collect();
                return Err(ReservationFailure {
                    error,
                    reserved,
                    held,
                });
            }
            reserved.push(item.clone());
        }
        Ok(())
    }

    fn release(&self, order_id: &OrderId, item: &OrderItem) -> InventoryResult<()> {
        self.ledger
            .adjust(item.product_id, item.quantity, AdjustmentReason::Compensation)
            .map(|_| ())
            .inspect_err(|err| {
                error!(order_id = %order_id, product_id = %item.product_id, error = %err, "release failed");
            })
    }
}

#[derive(Default)]
struct Slot {
    outcome: Option<Result<(), ReservationFailure>>,
    abandoned: bool,
}

type Stranded = Arc<Mutex<Vec<(OrderId, OrderItem)>>>;

/// Bounds how long a caller waits for a reservation.
///
/// The reservation runs on its own thread. If it finishes after the caller
/// gave up, that thread gives back whatever it took. Items it cannot give
/// back are queued and retried by [`StockReservation::release_stranded`].
pub struct TimeoutReservation {
    inner: Arc<dyn StockReservation>,
    timeout: Duration,
    stranded: Stranded,
}

impl TimeoutReservation {
    pub fn new(inner: Arc<dyn StockReservation>, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            stranded: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Items taken by a late reservation that are still waiting to go back.
    pub fn stranded(&self) -> usize {
        lock_stranded(&self.stranded).len()
    }
}

fn lock_stranded(stranded: &Stranded) -> MutexGuard<'_, Vec<(OrderId, OrderItem)>> {
    stranded.lock().unwrap_or_else(|p| p.into_inner())
}

impl StockReservation for TimeoutReservation {
    fn reserve(&self, order_id: &OrderId, items: &[OrderItem]) -> Result<(), ReservationFailure> {
        let shared = Arc::new((Mutex::new(Slot::default()), Condvar::new()));

        let worker_shared = Arc::clone(&shared);
        let inner = Arc::clone(&self.inner);
        let worker_order = order_id.clone();
        let worker_items = items.to_vec();
        let stranded = Arc::clone(&self.stranded);
        let spawned = thread::Builder::new()
            .name(format!("reserve-{order_id}"))
            .spawn(move || {
                let outcome = inner.reserve(&worker_order, &worker_items);
                let (lock, cvar) = &*worker_shared;
                let mut slot = lock.lock().unwrap_or_else(|p| p.into_inner());
                if slot.abandoned {
                    drop(slot);
                    let still_held = match outcome {
                        Ok(()) => worker_items,
                        Err(failure) => failure.held,
                    };
                    let failed: Vec<OrderItem> = still_held
                        .into_iter()
                        .filter(|item| inner.release(&worker_order, item).is_err())
                        .collect();
                    if failed.is_empty() {
                        warn!(order_id = %worker_order, "late reservation given back");
                    } else {
                        error!(order_id = %worker_order, stranded = failed.len(), "late reservation not fully given back");
                        lock_stranded(&stranded)
                            .extend(failed.into_iter().map(|item| (worker_order.clone(), item)));
                    }
                } else {
                    slot.outcome = Some(outcome);
                    cvar.notify_all();
                }
            });

        if let Err(err) = spawned {
            return Err(ReservationFailure::nothing_taken(InventoryError::reservation_failed(
                order_id.clone(),
                format!("could not start reservation: {err}"),
            )));
        }

        let (lock, cvar) = &*shared;
        let slot = lock.lock().unwrap_or_else(|p| p.into_inner());
        let (mut slot, _) = cvar
            .wait_timeout_while(slot, self.timeout, |s| s.outcome.is_none())
            .unwrap_or_else(|p| p.into_inner());

        match slot.outcome.take() {
            Some(outcome) => outcome,
            None => {
                slot.abandoned = true;
                warn!(order_id = %order_id, timeout_ms = self.timeout.as_millis() as u64, "reservation timed out");
                Err(ReservationFailure::nothing_taken(InventoryError::reservation_failed(
                    order_id.clone(),
                    format!("timed out after {:?}", self.timeout),
                )))
            }
        }
    }

    fn release(&self, order_id: &OrderId, item: &OrderItem) -> InventoryResult<()> {
        self.inner.release(order_id, item)
    }

    fn release_stranded(&self) -> StrandedRelease {
        let queued = std::mem::take(&mut *lock_stranded(&self.stranded));
        let mut result = StrandedRelease::default();
        let mut failed = Vec::new();
        for (order_id, item) in queued {
            if self.inner.release(&order_id, &item).is_ok() {
                result.returned += 1;
            } else {
                failed.push((order_id, item));
            }
        }
        result.still_stranded = failed.len();
        lock_stranded(&self.stranded).extend(failed);

        let inner = self.inner.release_stranded();
        result.returned += inner.returned;
        result.still_stranded += inner.still_stranded;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedgerStore;
    use crate::publisher::OutboxPublisher;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;
    use stockwise_core::ProductId;
    use stockwise_events::{BusMessage, InMemoryEventBus};

    fn ledger() -> Arc<StockLedger> {
        Arc::new(StockLedger::new(
            Arc::new(InMemoryLedgerStore::new()),
            Arc::new(OutboxPublisher::new(Arc::new(InMemoryEventBus::<BusMessage>::new()))),
        ))
    }

    #[test]
    fn partial_reservation_rolls_back() {
        let ledger = ledger();
        let (a, b) = (ProductId::new(), ProductId::new());
        ledger.register_product(a, 0, 10).unwrap();
        ledger.register_product(b, 0, 1).unwrap();
        let reservation = LedgerReservation::new(Arc::clone(&ledger));

        let failure = reservation
            .reserve(&OrderId::new("1"), &[OrderItem::new(a, 5), OrderItem::new(b, 5)])
            .unwrap_err();

        assert!(matches!(failure.error, InventoryError::InsufficientStock { .. }));
        assert_eq!(failure.reserved, vec![OrderItem::new(a, 5)]);
        assert!(failure.held.is_empty());
        assert_eq!(ledger.get_quantity(a).unwrap(), 10);
        let reasons: Vec<_> = ledger.history(a).unwrap().iter().map(|h| h.reason).collect();
        assert_eq!(
            reasons,
            vec![
                AdjustmentReason::Manual,
                AdjustmentReason::OrderFulfilled,
                AdjustmentReason::Compensation
            ]
        );
    }

    struct Slow {
        ledger: LedgerReservation,
        delay: Duration,
        refuse_release: AtomicBool,
    }

    fn slow(ledger: &Arc<StockLedger>, delay: Duration) -> Arc<Slow> {
        Arc::new(Slow {
            ledger: LedgerReservation::new(Arc::clone(ledger)),
            delay,
            refuse_release: AtomicBool::new(false),
        })
    }

    impl StockReservation for Slow {
        fn reserve(&self, order_id: &OrderId, items: &[OrderItem]) -> Result<(), ReservationFailure> {
            thread::sleep(self.delay);
            self.ledger.reserve(order_id, items)
        }

        fn release(&self, order_id: &OrderId, item: &OrderItem) -> InventoryResult<()> {
            if self.refuse_release.load(Ordering::SeqCst) {
                return Err(InventoryError::storage("ledger offline"));
            }
            self.ledger.release(order_id, item)
        }
    }

    #[test]
    fn late_reservation_is_given_back_after_timeout() {
        let ledger = ledger();
        let p = ProductId::new();
        ledger.register_product(p, 0, 10).unwrap();
        let reservation =
            TimeoutReservation::new(slow(&ledger, Duration::from_millis(100)), Duration::from_millis(10));

        let failure = reservation
            .reserve(&OrderId::new("1"), &[OrderItem::new(p, 4)])
            .unwrap_err();
        assert!(matches!(failure.error, InventoryError::ReservationFailed { .. }));

        // The late worker decrements and then gives the stock back.
        let deadline = Instant::now() + Duration::from_secs(5);
        while ledger.history(p).unwrap().len() < 3 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(ledger.get_quantity(p).unwrap(), 10);
    }

    #[test]
    fn late_release_failure_is_queued_and_retried() {
        let ledger = ledger();
        let p = ProductId::new();
        ledger.register_product(p, 0, 10).unwrap();
        let inner = slow(&ledger, Duration::from_millis(50));
        inner.refuse_release.store(true, Ordering::SeqCst);
        let reservation = TimeoutReservation::new(
            Arc::clone(&inner) as Arc<dyn StockReservation>,
            Duration::from_millis(5),
        );

        reservation
            .reserve(&OrderId::new("1"), &[OrderItem::new(p, 4)])
            .unwrap_err();

        let deadline = Instant::now() + Duration::from_secs(5);
        while reservation.stranded() == 0 {
            assert!(Instant::now() < deadline, "late worker never finished");
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(ledger.get_quantity(p).unwrap(), 6);
        assert_eq!(
            reservation.release_stranded(),
            StrandedRelease {
                returned: 0,
                still_stranded: 1
            }
        );

        inner.refuse_release.store(false, Ordering::SeqCst);
        assert_eq!(
            reservation.release_stranded(),
            StrandedRelease {
                returned: 1,
                still_stranded: 0
            }
        );
        assert_eq!(reservation.stranded(), 0);
        assert_eq!(ledger.get_quantity(p).unwrap(), 10);
    }

    #[test]
    fn fast_reservation_passes_through() {
        let ledger = ledger();
        let p = ProductId::new();
        ledger.register_product(p, 0, 10).unwrap();
        let reservation = TimeoutReservation::new(
            Arc::new(LedgerReservation::new(Arc::clone(&ledger))),
            Duration::from_secs(5),
        );

        reservation.reserve(&OrderId::new("1"), &[OrderItem::new(p, 4)]).unwrap();

        assert_eq!(ledger.get_quantity(p).unwrap(), 6);
    }
}
