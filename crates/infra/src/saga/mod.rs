//! Order saga: reserve stock, confirm, or compensate.
//!
//! ```text
//! CREATED --reserve ok--> CONFIRMED
//!    |
//!    +--reserve failed--> COMPENSATED
//!                  \----> COMPENSATION_PENDING --retry--> COMPENSATED
//! ```
//!
//! All steps for one order run under that order's lock.
//!
//! A record the order store refuses is kept in memory and takes precedence
//! over the stored copy until a later save succeeds. Stock that was taken or
//! given back is therefore never forgotten because of a failed write.

pub mod reservation;
pub mod store;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tracing::{error, info, warn};

use stockwise_core::{
    AggregateRoot, ExpectedVersion, InventoryError, InventoryResult, OrderId, execute,
};
use stockwise_events::channels;
use stockwise_orders::{
    ChangeStatus, CompensationEvent, Order, OrderItem, OrderStateChanged, OrderStats, OrderStatus,
};

use crate::publisher::{Publisher, publish_event};
use crate::replenishment::ReplenishmentScheduler;
use crate::store::StoreError;
use crate::sync::{KeyedLocks, acquire};

pub use reservation::{
    LedgerReservation, ReservationFailure, StockReservation, StrandedRelease, TimeoutReservation,
};
pub use store::{InMemoryOrderStore, OrderStore, SagaRecord};

/// How a saga run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaOutcome {
    Confirmed,
    /// Reservation failed and every taken item was given back.
    Compensated { failure: InventoryError },
    /// Reservation failed and some stock could not be given back yet.
    CompensationPending { failure: InventoryError },
}

impl SagaOutcome {
    pub fn status(&self) -> OrderStatus {
        match self {
            SagaOutcome::Confirmed => OrderStatus::Confirmed,
            SagaOutcome::Compensated { .. } => OrderStatus::Compensated,
            SagaOutcome::CompensationPending { .. } => OrderStatus::CompensationPending,
        }
    }
}

/// Result of a pass over `COMPENSATION_PENDING` orders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompensationSweep {
    pub completed: usize,
    pub still_pending: usize,
    pub failed: usize,
    /// Records written to the order store after an earlier save failed.
    pub saved: usize,
    /// Records the order store still refuses.
    pub unsaved: usize,
    /// Stock from timed-out reservations.
    pub stranded: StrandedRelease,
}

/// A record the store refused, and the version the store still holds.
type Unsaved = HashMap<OrderId, (SagaRecord, ExpectedVersion)>;

pub struct SagaCoordinator {
    orders: Arc<dyn OrderStore>,
    reservation: Arc<dyn StockReservation>,
    publisher: Arc<dyn Publisher>,
    replenisher: Option<Arc<ReplenishmentScheduler>>,
    locks: KeyedLocks<OrderId>,
    unsaved: Mutex<Unsaved>,
}

impl SagaCoordinator {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        reservation: Arc<dyn StockReservation>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            orders,
            reservation,
            publisher,
            replenisher: None,
            locks: KeyedLocks::new(),
            unsaved: Mutex::new(HashMap::new()),
        }
    }

    /// Ask `scheduler` to replenish a product whenever a reservation runs short.
    pub fn with_auto_replenish(mut self, scheduler: Arc<ReplenishmentScheduler>) -> Self {
        self.replenisher = Some(scheduler);
        self
    }

    /// Create the order and run reserve -> confirm, compensating on failure.
    ///
    /// A failed reservation is a normal outcome, not an `Err`. Errors mean the
    /// order could not be created or its state could not be recorded.
    pub fn process_order_saga(&self, order_id: OrderId, items: Vec<OrderItem>) -> InventoryResult<SagaOutcome> {
        self.with_order_lock(&order_id, || {
            let (order, created) = Order::create(order_id.clone(), items, Utc::now())?;
            self.orders
                .insert(SagaRecord::new(order.clone()))
                .map_err(|e| match e {
                    StoreError::AlreadyExists(_) => {
                        InventoryError::invalid_argument(format!("order {order_id} already exists"))
                    }
                    other => other.into(),
                })?;
            self.announce(&created);
            info!(order_id = %order_id, items = order.items().len(), "saga started");

            match self.reservation.reserve(&order_id, order.items()) {
                Ok(()) => self.confirm(order),
                Err(failure) => self.fail_reservation(order, failure),
            }
        })
    }

    fn confirm(&self, order: Order) -> InventoryResult<SagaOutcome> {
        let order_id = order.id().clone();
        let expected = ExpectedVersion::Exact(order.version());
        let mut record = SagaRecord::new(order);
        record.reserved = record.order.items().to_vec();
        record.held = record.reserved.clone();
        let reserved = record.clone();

        let confirmed = self.transition(&mut record, OrderStatus::Confirmed)?;

        if let Err(err) = self.orders.save(record, expected) {
            error!(order_id = %order_id, error = %err, "could not confirm order; compensating");
            self.persist(reserved, expected);
            let failure = InventoryError::reservation_failed(order_id.clone(), format!("confirm failed: {err}"));
            return self.compensate_after_failure(&order_id, failure);
        }

        self.announce(&confirmed);
        info!(order_id = %order_id, "order confirmed");
        Ok(SagaOutcome::Confirmed)
    }

    fn fail_reservation(&self, order: Order, failure: ReservationFailure) -> InventoryResult<SagaOutcome> {
        let order_id = order.id().clone();
        warn!(order_id = %order_id, error = %failure.error, "reservation failed");

        if let InventoryError::InsufficientStock { product_id, .. } = &failure.error {
            if let Some(scheduler) = &self.replenisher {
                if let Err(err) = scheduler.replenish_product(*product_id) {
                    warn!(order_id = %order_id, product_id = %product_id, error = %err, "auto-replenish failed");
                }
            }
        }

        let expected = ExpectedVersion::Exact(order.version());
        let mut record = SagaRecord::new(order);
        record.reserved = failure.reserved;
        record.held = failure.held;
        self.persist(record, expected);

        let reason = failure.error.to_string();
        self.compensate_after_failure(&order_id, InventoryError::reservation_failed(order_id.clone(), reason))
    }

    fn compensate_after_failure(&self, order_id: &OrderId, failure: InventoryError) -> InventoryResult<SagaOutcome> {
        match self.compensate_locked(order_id)? {
            OrderStatus::Compensated => Ok(SagaOutcome::Compensated { failure }),
            _ => Ok(SagaOutcome::CompensationPending { failure }),
        }
    }

    /// Give back everything the order still holds and mark it compensated.
    ///
    /// Emits one compensation event per reserved item the first time it runs.
    /// If some stock cannot be returned the order stays
    /// `COMPENSATION_PENDING` and is picked up by
    /// [`retry_pending_compensations`](Self::retry_pending_compensations).
    /// Calling this on an order that is already `COMPENSATED` fails with
    /// `CompensationAlreadyApplied` and changes nothing.
    pub fn compensate_order(&self, order_id: &OrderId) -> InventoryResult<OrderStatus> {
        self.with_order_lock(order_id, || self.compensate_locked(order_id))
    }

    fn compensate_locked(&self, order_id: &OrderId) -> InventoryResult<OrderStatus> {
        let (mut record, expected) = self.load(order_id)?;
        let status = record.order.status();
        if status == OrderStatus::Compensated {
            return Err(InventoryError::CompensationAlreadyApplied(order_id.clone()));
        }
        if !status.can_transition_to(OrderStatus::Compensated) {
            return Err(InventoryError::InvalidTransition {
                order_id: order_id.clone(),
                from: status.to_string(),
                to: OrderStatus::Compensated.to_string(),
            });
        }

        if !record.compensation_published {
            record.compensation_published = self.publish_compensation(order_id, &record.reserved);
        }

        let mut still_held = Vec::new();
        for item in std::mem::take(&mut record.held) {
            if let Err(err) = self.reservation.release(order_id, &item) {
                warn!(order_id = %order_id, product_id = %item.product_id, error = %err, "stock not returned yet");
                still_held.push(item);
            }
        }
        record.held = still_held;

        let target = if record.held.is_empty() && record.compensation_published {
            OrderStatus::Compensated
        } else {
            OrderStatus::CompensationPending
        };
        let changed = if record.order.status() != target {
            Some(self.transition(&mut record, target)?)
        } else {
            None
        };

        self.persist(record, expected);
        if let Some(event) = &changed {
            self.announce(event);
        }

        if target == OrderStatus::Compensated {
            info!(order_id = %order_id, "order compensated");
        } else {
            warn!(order_id = %order_id, "compensation pending");
        }
        Ok(target)
    }

    /// Write back records the store refused earlier, return stock stranded by
    /// timed-out reservations, then retry every order left in
    /// `COMPENSATION_PENDING`.
    pub fn retry_pending_compensations(&self) -> InventoryResult<CompensationSweep> {
        let mut sweep = CompensationSweep::default();
        (sweep.saved, sweep.unsaved) = self.save_unsaved();
        sweep.stranded = self.reservation.release_stranded();

        let pending = self
            .list_orders(Some(OrderStatus::CompensationPending))
            .or_else(|err| {
                warn!(error = %err, "order store unreachable; retrying unsaved orders only");
                Ok::<_, InventoryError>(self.unsaved_orders(Some(OrderStatus::CompensationPending)))
            })?;

        for order in pending {
            match self.compensate_order(order.id()) {
                Ok(OrderStatus::Compensated) => sweep.completed += 1,
                Ok(_) => sweep.still_pending += 1,
                Err(err) => {
                    warn!(order_id = %order.id(), error = %err, "compensation retry failed");
                    sweep.failed += 1;
                }
            }
        }
        if sweep != CompensationSweep::default() {
            info!(
                completed = sweep.completed,
                still_pending = sweep.still_pending,
                failed = sweep.failed,
                saved = sweep.saved,
                unsaved = sweep.unsaved,
                stranded_returned = sweep.stranded.returned,
                stranded = sweep.stranded.still_stranded,
                "compensation sweep finished"
            );
        }
        Ok(sweep)
    }

    pub fn get_order(&self, order_id: &OrderId) -> InventoryResult<Order> {
        Ok(self.load(order_id)?.0.order)
    }

    pub fn saga_record(&self, order_id: &OrderId) -> InventoryResult<SagaRecord> {
        Ok(self.load(order_id)?.0)
    }

    /// Orders, optionally filtered by status, oldest first.
    pub fn list_orders(&self, status: Option<OrderStatus>) -> InventoryResult<Vec<Order>> {
        let mut records: HashMap<OrderId, SagaRecord> = self
            .orders
            .list()?
            .into_iter()
            .map(|r| (r.order.id().clone(), r))
            .collect();
        for (id, (record, _)) in self.unsaved_records().iter() {
            records.insert(id.clone(), record.clone());
        }

        let mut orders: Vec<Order> = records
            .into_values()
            .map(|r| r.order)
            .filter(|o| status.is_none_or(|s| o.status() == s))
            .collect();
        orders.sort_by_key(|o| o.created_at());
        Ok(orders)
    }

    pub fn order_stats(&self) -> InventoryResult<OrderStats> {
        Ok(OrderStats::from_orders(&self.list_orders(None)?))
    }

    /// Order ids with a live lock slot.
    pub fn locked_orders(&self) -> usize {
        self.locks.len()
    }

    fn with_order_lock<T>(&self, order_id: &OrderId, f: impl FnOnce() -> InventoryResult<T>) -> InventoryResult<T> {
        let slot = self.locks.slot(order_id)?;
        let result = {
            let _guard = acquire(&slot);
            f()
        };
        drop(slot);
        self.locks.prune(order_id);
        result
    }

    /// The newest known record, unsaved or stored, and the version the store
    /// holds for it.
    fn load(&self, order_id: &OrderId) -> InventoryResult<(SagaRecord, ExpectedVersion)> {
        if let Some((record, expected)) = self.unsaved_records().get(order_id) {
            return Ok((record.clone(), *expected));
        }
        let record = self
            .orders
            .load(order_id)?
            .ok_or_else(|| InventoryError::OrderNotFound(order_id.clone()))?;
        let expected = ExpectedVersion::Exact(record.order.version());
        Ok((record, expected))
    }

    /// Save `record`, or keep it in memory if the store refuses it.
    /// Caller holds the order lock.
    fn persist(&self, record: SagaRecord, expected: ExpectedVersion) -> bool {
        let order_id = record.order.id().clone();
        match self.orders.save(record.clone(), expected) {
            Ok(()) => {
                self.unsaved_records().remove(&order_id);
                true
            }
            Err(err) => {
                warn!(
                    order_id = %order_id,
                    status = %record.order.status(),
                    held = record.held.len(),
                    error = %err,
                    "order state not saved; keeping it in memory"
                );
                self.unsaved_records().insert(order_id, (record, expected));
                false
            }
        }
    }

    /// Returns `(saved, still_unsaved)`.
    fn save_unsaved(&self) -> (usize, usize) {
        let ids: Vec<OrderId> = self.unsaved_records().keys().cloned().collect();
        let mut saved = 0;
        let mut unsaved = 0;
        for id in ids {
            let written = self.with_order_lock(&id, || {
                let entry = self.unsaved_records().get(&id).cloned();
                Ok(entry.is_none_or(|(record, expected)| self.persist(record, expected)))
            });
            match written {
                Ok(true) => saved += 1,
                _ => unsaved += 1,
            }
        }
        (saved, unsaved)
    }

    fn unsaved_orders(&self, status: Option<OrderStatus>) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .unsaved_records()
            .values()
            .map(|(record, _)| record.order.clone())
            .filter(|o| status.is_none_or(|s| o.status() == s))
            .collect();
        orders.sort_by_key(|o| o.created_at());
        orders
    }

    fn unsaved_records(&self) -> MutexGuard<'_, Unsaved> {
        self.unsaved.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn transition(&self, record: &mut SagaRecord, to: OrderStatus) -> InventoryResult<OrderStateChanged> {
        let cmd = ChangeStatus {
            order_id: record.order.id().clone(),
            to,
            requested_at: Utc::now(),
        };
        let mut events = execute(&mut record.order, &cmd)?;
        events
            .pop()
            .ok_or_else(|| InventoryError::storage("status change produced no event"))
    }

    /// Returns whether every event was accepted by the publisher.
    fn publish_compensation(&self, order_id: &OrderId, reserved: &[OrderItem]) -> bool {
        let mut all_published = true;
        for item in reserved {
            let event = CompensationEvent {
                order_id: Some(order_id.clone()),
                product_id: item.product_id,
                quantity: item.quantity,
                occurred_at: Utc::now(),
            };
            let key = Some(item.product_id.to_string());
            if let Err(err) = publish_event(self.publisher.as_ref(), channels::INVENTORY_COMPENSATION, key, &event) {
                error!(order_id = %order_id, product_id = %item.product_id, error = %err, "failed to publish compensation");
                all_published = false;
            }
        }
        all_published
    }

    fn announce(&self, event: &OrderStateChanged) {
        let key = Some(event.order_id.to_string());
        if let Err(err) = publish_event(self.publisher.as_ref(), channels::ORDER_EVENTS, key, event) {
            error!(order_id = %event.order_id, event_type = %event.event_type, error = %err, "failed to publish order event");
        }
    }
}
