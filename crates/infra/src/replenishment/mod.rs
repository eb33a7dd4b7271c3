//! Periodic replenishment of low-stock products.
//!
//! Each run scans for products below their min threshold, asks the demand
//! estimator how much will be needed, and for every positive shortfall:
//! records a `PENDING` order, publishes it, credits the ledger with
//! `AUTO_REPLENISHMENT` and marks the order `SENT`.
//!
//! Stock is credited when the order is sent, not when goods arrive. An order
//! left `PENDING` by a failed credit or save is finished by
//! [`ReplenishmentScheduler::settle_pending_orders`] and before any new order
//! for the same product.

pub mod history;
pub mod store;

use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};

use stockwise_ai::DemandEstimator;
use stockwise_core::{InventoryError, InventoryResult, ProductId, ReplenishmentOrderId};
use stockwise_events::channels;
use stockwise_inventory::{
    AdjustmentReason, ForecastSource, ReplenishmentOrder, ReplenishmentPlan, ReplenishmentStatus,
    StockRecord,
};

use crate::ledger::StockLedger;
use crate::publisher::{Publisher, publish_event};
use crate::retry::RetryPolicy;
use crate::sync::{KeyedLocks, acquire};

pub use history::LedgerSalesHistory;
pub use store::{InMemoryReplenishmentOrderStore, ReplenishmentOrderStore};

/// Outcome of one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplenishmentReport {
    pub scanned: usize,
    pub ordered: Vec<ReplenishmentOrder>,
    /// Low-stock products whose plan came out at zero.
    pub skipped: usize,
    pub failed: Vec<(ProductId, InventoryError)>,
}

pub struct ReplenishmentScheduler {
    ledger: Arc<StockLedger>,
    estimator: Arc<dyn DemandEstimator>,
    orders: Arc<dyn ReplenishmentOrderStore>,
    publisher: Arc<dyn Publisher>,
    safety_factor: f64,
    locks: KeyedLocks<ProductId>,
    run: Mutex<()>,
    /// Orders whose stock was credited but whose `SENT` state is not saved yet.
    credited: Mutex<HashSet<ReplenishmentOrderId>>,
}

impl ReplenishmentScheduler {
    pub fn new(
        ledger: Arc<StockLedger>,
        estimator: Arc<dyn DemandEstimator>,
        orders: Arc<dyn ReplenishmentOrderStore>,
        publisher: Arc<dyn Publisher>,
        safety_factor: f64,
    ) -> Self {
        Self {
            ledger,
            estimator,
            orders,
            publisher,
            safety_factor,
            locks: KeyedLocks::new(),
            run: Mutex::new(()),
            credited: Mutex::new(HashSet::new()),
        }
    }

    /// Scan once. A failure on one product is recorded and the scan moves on;
    /// only a failed scan itself is an error.
    pub fn run_once(&self) -> InventoryResult<ReplenishmentReport> {
        let _run = self.run.lock().unwrap_or_else(|p| p.into_inner());

        let low = self.ledger.list_below_min_threshold()?;
        let mut report = ReplenishmentReport {
            scanned: low.len(),
            ..ReplenishmentReport::default()
        };

        for record in low {
            let product_id = record.product_id();
            match self.replenish_product(product_id) {
                Ok(Some(order)) => report.ordered.push(order),
                Ok(None) => report.skipped += 1,
                Err(err) => {
                    warn!(product_id = %product_id, error = %err, "replenishment failed for product");
                    report.failed.push((product_id, err));
                }
            }
        }

        info!(
            scanned = report.scanned,
            ordered = report.ordered.len(),
            skipped = report.skipped,
            failed = report.failed.len(),
            "replenishment run finished"
        );
        Ok(report)
    }

    /// Plan and place an order for one product, if its current stock calls
    /// for one. Concurrent calls for the same product serialize, and each
    /// re-reads the record, so a second caller sees the first one's credit.
    /// Orders still `PENDING` for the product are finished first.
    pub fn replenish_product(&self, product_id: ProductId) -> InventoryResult<Option<ReplenishmentOrder>> {
        let slot = self.locks.slot(&product_id)?;
        let _guard = acquire(&slot);

        self.settle_product(product_id)?;

        let record = self.ledger.get_record(product_id)?;
        let plan = ReplenishmentPlan::for_record(&record, self.forecast(&record), self.safety_factor);
        if !plan.needs_order() {
            info!(product_id = %product_id, quantity = record.quantity(), "no replenishment needed");
            return Ok(None);
        }

        let mut order = ReplenishmentOrder::new(product_id, plan.required, Utc::now())?;
        self.orders.save(order.clone())?;
        publish_event(
            self.publisher.as_ref(),
            channels::REPLENISHMENT_ORDERS,
            Some(product_id.to_string()),
            &order.to_event(),
        )
        .map_err(|e| InventoryError::storage(e.to_string()))?;

        let quantity = self.credit_and_send(&mut order)?;

        info!(
            product_id = %product_id,
            order_id = %order.id(),
            required = plan.required,
            source = ?plan.source,
            quantity,
            "replenishment order sent"
        );
        Ok(Some(order))
    }

    /// Finish every order an earlier failure left `PENDING`: credit its stock
    /// unless that already happened, then mark it `SENT`. Returns how many
    /// orders were finished; products that still fail are logged and retried
    /// on the next call.
    pub fn settle_pending_orders(&self) -> InventoryResult<usize> {
        let mut products: Vec<ProductId> = self
            .orders
            .list()?
            .iter()
            .filter(|o| o.status() == ReplenishmentStatus::Pending)
            .map(|o| o.product_id())
            .collect();
        products.sort();
        products.dedup();

        let mut settled = 0;
        for product_id in products {
            let slot = self.locks.slot(&product_id)?;
            let _guard = acquire(&slot);
            match self.settle_product(product_id) {
                Ok(n) => settled += n,
                Err(err) => warn!(product_id = %product_id, error = %err, "pending replenishment still unsettled"),
            }
        }
        if settled > 0 {
            info!(settled, "pending replenishment orders settled");
        }
        Ok(settled)
    }

    /// Caller holds the product lock.
    fn settle_product(&self, product_id: ProductId) -> InventoryResult<usize> {
        let pending: Vec<ReplenishmentOrder> = self
            .orders
            .list_for_product(product_id)?
            .into_iter()
            .filter(|o| o.status() == ReplenishmentStatus::Pending)
            .collect();

        let mut settled = 0;
        for mut order in pending {
            let quantity = self.credit_and_send(&mut order)?;
            info!(product_id = %product_id, order_id = %order.id(), quantity, "pending replenishment order sent");
            settled += 1;
        }
        Ok(settled)
    }

    /// Credit the order's quantity once, then record it as `SENT`. The credit
    /// is remembered, so a failed save is retried without a second credit.
    fn credit_and_send(&self, order: &mut ReplenishmentOrder) -> InventoryResult<i64> {
        let product_id = order.product_id();
        let already_credited = self.credited_orders().contains(&order.id());
        let quantity = if already_credited {
            self.ledger.get_quantity(product_id)?
        } else {
            let quantity = self
                .ledger
                .adjust(product_id, order.quantity(), AdjustmentReason::AutoReplenishment)?;
            self.credited_orders().insert(order.id());
            quantity
        };

        order.mark_sent()?;
        self.orders.save(order.clone())?;
        self.credited_orders().remove(&order.id());
        Ok(quantity)
    }

    fn credited_orders(&self) -> std::sync::MutexGuard<'_, HashSet<ReplenishmentOrderId>> {
        self.credited.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn orders(&self) -> InventoryResult<Vec<ReplenishmentOrder>> {
        Ok(self.orders.list()?)
    }

    fn forecast(&self, record: &StockRecord) -> ForecastSource {
        match self.estimator.estimate(record.product_id()) {
            Ok(forecast) => ForecastSource::Estimator {
                prediction: forecast.prediction,
            },
            Err(err) => {
                let err = InventoryError::from(err);
                warn!(product_id = %record.product_id(), error = %err, "using fallback reorder heuristic");
                ForecastSource::Fallback
            }
        }
    }

    /// Run on a background thread: once at start, then every `interval`, and
    /// whenever [`SchedulerHandle::trigger`] is called.
    /// A failed scan is retried with `retry` backoff before waiting for the
    /// next tick.
    pub fn spawn(self: &Arc<Self>, interval: Duration, retry: RetryPolicy) -> io::Result<SchedulerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let (trigger_tx, trigger_rx) = mpsc::sync_channel::<()>(1);

        let scheduler = Arc::clone(self);
        let join = thread::Builder::new()
            .name("replenishment-scheduler".to_string())
            .spawn(move || runner_loop(&scheduler, interval, retry, shutdown_rx, trigger_rx))?;

        Ok(SchedulerHandle {
            shutdown: shutdown_tx,
            trigger: trigger_tx,
            join: Some(join),
        })
    }
}

/// Controls a spawned scheduler thread.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: mpsc::Sender<()>,
    trigger: mpsc::SyncSender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Request an extra run. Triggers coalesce while one is already queued.
    pub fn trigger(&self) {
        let _ = self.trigger.try_send(());
    }

    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

fn runner_loop(
    scheduler: &ReplenishmentScheduler,
    interval: Duration,
    retry: RetryPolicy,
    shutdown_rx: mpsc::Receiver<()>,
    trigger_rx: mpsc::Receiver<()>,
) {
    info!(interval_secs = interval.as_secs(), "replenishment scheduler started");

    let mut next_tick = Instant::now() + interval;
    let mut pending = true;
    let mut failures: u32 = 0;
    let mut backoff_until: Option<Instant> = None;

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        let now = Instant::now();
        if now >= next_tick {
            pending = true;
            while next_tick <= now {
                next_tick += interval;
            }
        }

        while trigger_rx.try_recv().is_ok() {
            pending = true;
        }

        if let Some(until) = backoff_until {
            if Instant::now() < until {
                thread::sleep(Duration::from_millis(50));
                continue;
            }
            backoff_until = None;
        }

        if !pending {
            let sleep_for = next_tick
                .saturating_duration_since(Instant::now())
                .min(Duration::from_millis(250));
            thread::sleep(sleep_for);
            continue;
        }
        pending = false;

        match scheduler.run_once() {
            Ok(_) => failures = 0,
            Err(err) => {
                failures += 1;
                warn!(error = %err, failures, "replenishment scan failed");
                if retry.should_retry(failures) {
                    pending = true;
                    backoff_until = Some(Instant::now() + retry.delay_for_attempt(failures));
                } else {
                    // Wait for the next tick.
                    failures = 0;
                }
            }
        }
    }

    info!("replenishment scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedgerStore;
    use crate::publisher::OutboxPublisher;
    use stockwise_ai::{AiError, DemandForecast};
    use crate::store::StoreError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use stockwise_events::{BusMessage, EventBus, InMemoryEventBus, Subscription};
    use stockwise_inventory::ReplenishmentEvent;

    struct Fixture {
        scheduler: Arc<ReplenishmentScheduler>,
        ledger: Arc<StockLedger>,
        ledger_store: Arc<InMemoryLedgerStore>,
        tap: Subscription<BusMessage>,
    }

    fn fixture(estimator: Arc<dyn DemandEstimator>) -> Fixture {
        fixture_with(estimator, Arc::new(InMemoryReplenishmentOrderStore::new()))
    }

    fn fixture_with(estimator: Arc<dyn DemandEstimator>, orders: Arc<dyn ReplenishmentOrderStore>) -> Fixture {
        let bus = Arc::new(InMemoryEventBus::<BusMessage>::new());
        let tap = bus.subscribe();
        let publisher: Arc<dyn Publisher> = Arc::new(OutboxPublisher::new(bus));
        let ledger_store = Arc::new(InMemoryLedgerStore::new());
        let ledger = Arc::new(StockLedger::new(
            Arc::clone(&ledger_store) as Arc<dyn crate::ledger::LedgerStore>,
            Arc::clone(&publisher),
        ));
        let scheduler = Arc::new(ReplenishmentScheduler::new(
            Arc::clone(&ledger),
            estimator,
            orders,
            publisher,
            1.2,
        ));
        Fixture {
            scheduler,
            ledger,
            ledger_store,
            tap,
        }
    }

    /// Rejects the first save of a `SENT` order.
    #[derive(Default)]
    struct DropFirstSent {
        inner: InMemoryReplenishmentOrderStore,
        tripped: AtomicBool,
    }

    impl ReplenishmentOrderStore for DropFirstSent {
        fn save(&self, order: ReplenishmentOrder) -> Result<(), StoreError> {
            if order.status() == ReplenishmentStatus::Sent && !self.tripped.swap(true, Ordering::SeqCst) {
                return Err(StoreError::Unavailable("replenishment store offline".to_string()));
            }
            self.inner.save(order)
        }

        fn get(&self, id: ReplenishmentOrderId) -> Result<Option<ReplenishmentOrder>, StoreError> {
            self.inner.get(id)
        }

        fn list(&self) -> Result<Vec<ReplenishmentOrder>, StoreError> {
            self.inner.list()
        }
    }

    fn predicting(prediction: f64) -> Arc<dyn DemandEstimator> {
        Arc::new(move |_: ProductId| -> Result<DemandForecast, AiError> { Ok(DemandForecast::new(prediction)) })
    }

    fn failing() -> Arc<dyn DemandEstimator> {
        Arc::new(|_: ProductId| -> Result<DemandForecast, AiError> {
            Err(AiError::Timeout(Duration::from_millis(5)))
        })
    }

    #[test]
    fn forecast_drives_quantity_with_safety_factor() {
        let f = fixture(predicting(10.0));
        let p = ProductId::new();
        f.ledger.register_product(p, 5, 2).unwrap();

        let report = f.scheduler.run_once().unwrap();

        // ceil(10 * 1.2) - 2 = 10
        assert_eq!(report.ordered.len(), 1);
        assert_eq!(report.ordered[0].quantity(), 10);
        assert_eq!(report.ordered[0].status(), ReplenishmentStatus::Sent);
        assert_eq!(f.ledger.get_quantity(p).unwrap(), 12);
        assert_eq!(
            f.ledger.history(p).unwrap().last().unwrap().reason,
            AdjustmentReason::AutoReplenishment
        );
    }

    #[test]
    fn estimator_failure_falls_back_to_threshold_gap() {
        let f = fixture(failing());
        let p = ProductId::new();
        f.ledger.register_product(p, 8, 3).unwrap();

        let report = f.scheduler.run_once().unwrap();

        assert_eq!(report.ordered[0].quantity(), 5);
        assert_eq!(f.ledger.get_quantity(p).unwrap(), 8);
    }

    #[test]
    fn published_order_is_pending_and_keyed_by_product() {
        let f = fixture(predicting(4.0));
        let p = ProductId::new();
        f.ledger.register_product(p, 2, 1).unwrap();

        f.scheduler.run_once().unwrap();

        let msg = f
            .tap
            .drain()
            .into_iter()
            .find(|m| m.channel() == channels::REPLENISHMENT_ORDERS)
            .unwrap();
        let event: ReplenishmentEvent = msg.decode().unwrap();
        assert_eq!(msg.key(), Some(p.to_string().as_str()));
        assert_eq!(event.status, ReplenishmentStatus::Pending);
        assert_eq!(event.quantity, 4);
    }

    #[test]
    fn stocked_products_are_left_alone() {
        let f = fixture(predicting(100.0));
        let low = ProductId::new();
        let fine = ProductId::new();
        f.ledger.register_product(low, 5, 0).unwrap();
        f.ledger.register_product(fine, 5, 50).unwrap();

        let report = f.scheduler.run_once().unwrap();

        assert_eq!(report.scanned, 1);
        assert_eq!(f.ledger.get_quantity(fine).unwrap(), 50);
    }

    #[test]
    fn zero_forecast_skips_order() {
        let f = fixture(predicting(0.0));
        let p = ProductId::new();
        f.ledger.register_product(p, 5, 1).unwrap();

        let report = f.scheduler.run_once().unwrap();

        assert_eq!(report.skipped, 1);
        assert!(f.scheduler.orders().unwrap().is_empty());
    }

    #[test]
    fn second_replenish_sees_first_credit() {
        let f = fixture(failing());
        let p = ProductId::new();
        f.ledger.register_product(p, 10, 0).unwrap();

        assert!(f.scheduler.replenish_product(p).unwrap().is_some());
        assert!(f.scheduler.replenish_product(p).unwrap().is_none());
        assert_eq!(f.ledger.get_quantity(p).unwrap(), 10);
    }

    #[test]
    fn spawned_scheduler_runs_on_trigger() {
        let f = fixture(failing());
        let handle = f
            .scheduler
            .spawn(Duration::from_secs(3600), RetryPolicy::default())
            .unwrap();
        let p = ProductId::new();
        f.ledger.register_product(p, 4, 0).unwrap();

        handle.trigger();
        let deadline = Instant::now() + Duration::from_secs(5);
        while f.ledger.get_quantity(p).unwrap() == 0 {
            assert!(Instant::now() < deadline, "scheduler never ran");
            thread::sleep(Duration::from_millis(20));
        }
        handle.shutdown();

        assert_eq!(f.ledger.get_quantity(p).unwrap(), 4);
    }

    #[test]
    fn failed_credit_leaves_order_pending_until_settled() {
        let f = fixture(failing());
        let p = ProductId::new();
        f.ledger.register_product(p, 10, 0).unwrap();

        f.ledger_store.set_available(false);
        assert!(f.scheduler.replenish_product(p).is_err());
        let orders = f.scheduler.orders().unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status(), ReplenishmentStatus::Pending);

        // Still offline: nothing settles, nothing is lost.
        assert_eq!(f.scheduler.settle_pending_orders().unwrap(), 0);

        f.ledger_store.set_available(true);
        assert_eq!(f.scheduler.settle_pending_orders().unwrap(), 1);
        assert_eq!(f.ledger.get_quantity(p).unwrap(), 10);
        assert_eq!(f.scheduler.orders().unwrap()[0].status(), ReplenishmentStatus::Sent);
        assert_eq!(f.scheduler.settle_pending_orders().unwrap(), 0);
    }

    #[test]
    fn next_replenish_finishes_pending_order_instead_of_placing_another() {
        let f = fixture(failing());
        let p = ProductId::new();
        f.ledger.register_product(p, 6, 0).unwrap();

        f.ledger_store.set_available(false);
        assert!(f.scheduler.replenish_product(p).is_err());
        f.ledger_store.set_available(true);

        assert!(f.scheduler.replenish_product(p).unwrap().is_none());
        assert_eq!(f.ledger.get_quantity(p).unwrap(), 6);
        assert_eq!(f.scheduler.orders().unwrap().len(), 1);
    }

    #[test]
    fn failed_sent_save_is_retried_without_second_credit() {
        let f = fixture_with(failing(), Arc::new(DropFirstSent::default()));
        let p = ProductId::new();
        f.ledger.register_product(p, 5, 0).unwrap();

        assert!(f.scheduler.replenish_product(p).is_err());
        assert_eq!(f.ledger.get_quantity(p).unwrap(), 5);
        assert_eq!(f.scheduler.orders().unwrap()[0].status(), ReplenishmentStatus::Pending);

        assert_eq!(f.scheduler.settle_pending_orders().unwrap(), 1);
        assert_eq!(f.ledger.get_quantity(p).unwrap(), 5);
        assert_eq!(f.ledger.verify_replay(p).unwrap(), 5);
        assert_eq!(f.scheduler.orders().unwrap()[0].status(), ReplenishmentStatus::Sent);
    }
}
