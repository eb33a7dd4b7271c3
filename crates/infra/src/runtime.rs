//! Process wiring: builds every service over one bus and starts the workers.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use stockwise_ai::{DemandEstimator, MovingAverageEstimator, TimeoutEstimator};
use stockwise_core::InventoryResult;
use stockwise_events::{BusMessage, EventBus, channels};

use crate::compensation::CompensationHandler;
use crate::config::InventoryConfig;
use crate::consumer::OrderEventConsumer;
use crate::idempotency::{IdempotencyGuard, InMemoryProcessedEventStore};
use crate::ledger::{InMemoryLedgerStore, StockLedger};
use crate::publisher::{FlushReport, OutboxPublisher, PublishError, Publisher};
use crate::replenishment::{
    InMemoryReplenishmentOrderStore, LedgerSalesHistory, ReplenishmentScheduler, SchedulerHandle,
};
use crate::router::EventRouter;
use crate::saga::{
    CompensationSweep, InMemoryOrderStore, LedgerReservation, SagaCoordinator, TimeoutReservation,
};
use crate::workers::{WorkerPool, WorkerPoolConfig, WorkerPoolHandle};

/// A running inventory service.
///
/// Holds the in-memory stores, the outbox in front of `bus`, the order-event
/// worker pool, the optional compensation worker pool and the replenishment
/// scheduler thread.
pub struct InventoryRuntime<B: EventBus<BusMessage>> {
    config: InventoryConfig,
    ledger: Arc<StockLedger>,
    guard: IdempotencyGuard,
    outbox: Arc<OutboxPublisher<B>>,
    saga: Arc<SagaCoordinator>,
    scheduler: Arc<ReplenishmentScheduler>,
    order_workers: Option<WorkerPoolHandle>,
    compensation_workers: Option<WorkerPoolHandle>,
    scheduler_thread: Option<SchedulerHandle>,
}

impl<B> InventoryRuntime<B>
where
    B: EventBus<BusMessage> + Clone + 'static,
{
    /// Build and start everything.
    ///
    /// Without an `estimator` the local moving-average model over ledger
    /// history is used. Either way calls are bounded by
    /// `config.estimator_timeout`.
    pub fn start(
        config: InventoryConfig,
        bus: B,
        estimator: Option<Arc<dyn DemandEstimator>>,
    ) -> anyhow::Result<Self> {
        let outbox = Arc::new(OutboxPublisher::new(bus.clone()));
        let publisher: Arc<dyn Publisher> = outbox.clone();

        let ledger = Arc::new(StockLedger::new(
            Arc::new(InMemoryLedgerStore::new()),
            Arc::clone(&publisher),
        ));
        let guard = IdempotencyGuard::new(Arc::new(InMemoryProcessedEventStore::new()));

        let estimator: Arc<dyn DemandEstimator> = match estimator {
            Some(estimator) => estimator,
            None => Arc::new(MovingAverageEstimator::new(LedgerSalesHistory::new(Arc::clone(&ledger)))),
        };
        let estimator: Arc<dyn DemandEstimator> =
            Arc::new(TimeoutEstimator::new(estimator, config.estimator_timeout));

        let scheduler = Arc::new(ReplenishmentScheduler::new(
            Arc::clone(&ledger),
            estimator,
            Arc::new(InMemoryReplenishmentOrderStore::new()),
            Arc::clone(&publisher),
            config.safety_factor,
        ));

        let reservation = TimeoutReservation::new(
            Arc::new(LedgerReservation::new(Arc::clone(&ledger))),
            config.reservation_timeout,
        );
        let mut saga = SagaCoordinator::new(
            Arc::new(InMemoryOrderStore::new()),
            Arc::new(reservation),
            Arc::clone(&publisher),
        );
        if config.auto_replenish_on_shortage {
            saga = saga.with_auto_replenish(Arc::clone(&scheduler));
        }

        let mut runtime = Self {
            config: config.clone(),
            ledger: Arc::clone(&ledger),
            guard: guard.clone(),
            outbox,
            saga: Arc::new(saga),
            scheduler: Arc::clone(&scheduler),
            order_workers: None,
            compensation_workers: None,
            scheduler_thread: None,
        };

        // On any start-up failure the partially built runtime is shut down
        // before returning, so no thread outlives the error.
        let consumer = OrderEventConsumer::new(
            guard.clone(),
            EventRouter::new(Arc::clone(&ledger)),
            Arc::clone(&publisher),
        );
        let pool = WorkerPoolConfig::new("order-events", channels::ORDER_EVENTS, config.worker_count)
            .with_retry(config.retry_policy());
        match WorkerPool::spawn(pool, &bus, Arc::new(consumer), Arc::clone(&publisher)) {
            Ok(handle) => runtime.order_workers = Some(handle),
            Err(err) => {
                runtime.shutdown();
                return Err(err).context("failed to start order-event workers");
            }
        }

        if config.consume_compensation_channel {
            let handler = CompensationHandler::new(guard, Arc::clone(&ledger), Arc::clone(&publisher));
            let pool = WorkerPoolConfig::new("compensation", channels::INVENTORY_COMPENSATION, 1)
                .with_retry(config.retry_policy());
            match WorkerPool::spawn(pool, &bus, Arc::new(handler), Arc::clone(&publisher)) {
                Ok(handle) => runtime.compensation_workers = Some(handle),
                Err(err) => {
                    runtime.shutdown();
                    return Err(err).context("failed to start compensation workers");
                }
            }
        }

        match scheduler.spawn(config.replenishment_interval, config.retry_policy()) {
            Ok(handle) => runtime.scheduler_thread = Some(handle),
            Err(err) => {
                runtime.shutdown();
                return Err(err).context("failed to start replenishment scheduler");
            }
        }

        info!(
            workers = config.worker_count,
            consume_compensation = config.consume_compensation_channel,
            auto_replenish = config.auto_replenish_on_shortage,
            "inventory runtime started"
        );
        Ok(runtime)
    }

    pub fn config(&self) -> &InventoryConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<StockLedger> {
        &self.ledger
    }

    pub fn saga(&self) -> &Arc<SagaCoordinator> {
        &self.saga
    }

    pub fn scheduler(&self) -> &Arc<ReplenishmentScheduler> {
        &self.scheduler
    }

    pub fn guard(&self) -> &IdempotencyGuard {
        &self.guard
    }

    pub fn outbox(&self) -> &Arc<OutboxPublisher<B>> {
        &self.outbox
    }

    /// Ask the scheduler thread for an extra scan.
    pub fn trigger_replenishment(&self) {
        if let Some(handle) = &self.scheduler_thread {
            handle.trigger();
        }
    }

    /// Housekeeping: redeliver pending outbox messages, retry pending
    /// compensations, finish replenishment orders stuck in `PENDING` and
    /// prune old processed-event ids.
    pub fn run_maintenance(&self) -> InventoryResult<MaintenanceReport> {
        let outbox = self.flush_outbox().unwrap_or_else(|err| {
            warn!(error = %err, "outbox flush failed");
            FlushReport::default()
        });
        let compensations = self.saga.retry_pending_compensations()?;
        let replenishments_settled = self.scheduler.settle_pending_orders()?;
        let pruned = self.guard.prune(self.config.processed_event_retention)?;
        Ok(MaintenanceReport {
            outbox,
            compensations,
            replenishments_settled,
            pruned_events: pruned,
        })
    }

    pub fn flush_outbox(&self) -> Result<FlushReport, PublishError> {
        self.outbox.flush_pending()
    }
}

impl<B: EventBus<BusMessage>> InventoryRuntime<B> {
    /// Stop every thread and wait for them.
    pub fn shutdown(&mut self) {
        let mut stopped = false;
        if let Some(handle) = self.scheduler_thread.take() {
            handle.shutdown();
            stopped = true;
        }
        if let Some(handle) = self.compensation_workers.take() {
            handle.shutdown();
            stopped = true;
        }
        if let Some(handle) = self.order_workers.take() {
            handle.shutdown();
            stopped = true;
        }
        if stopped {
            info!("inventory runtime stopped");
        }
    }
}

impl<B: EventBus<BusMessage>> Drop for InventoryRuntime<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub outbox: FlushReport,
    pub compensations: CompensationSweep,
    pub replenishments_settled: usize,
    pub pruned_events: usize,
}
