//! Stock ledger: the only writer of stock records.
//!
//! Each product has its own lock. An adjustment loads the record, decides via
//! the `StockRecord` aggregate, commits record + history in one batch,
//! refreshes the cache and publishes the change, all while holding that lock,
//! so concurrent writers on one product serialize and their events leave in
//! commit order.

pub mod cache;
pub mod store;

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use stockwise_core::{
    AggregateRoot, ExpectedVersion, InventoryError, InventoryResult, ProductId, execute,
};
use stockwise_events::channels;
use stockwise_inventory::{
    AdjustStock, AdjustmentReason, AdjustmentRecord, StockAdjusted, StockRecord, replay,
};

use crate::publisher::{Publisher, publish_event};
use crate::store::StoreError;
use crate::sync::{KeyedLocks, acquire};

pub use cache::StockCache;
pub use store::{InMemoryLedgerStore, LedgerStore, LedgerWrite};

pub struct StockLedger {
    store: Arc<dyn LedgerStore>,
    cache: StockCache,
    locks: KeyedLocks<ProductId>,
    publisher: Arc<dyn Publisher>,
}

impl StockLedger {
    pub fn new(store: Arc<dyn LedgerStore>, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            store,
            cache: StockCache::new(),
            locks: KeyedLocks::new(),
            publisher,
        }
    }

    /// Create a stock record. A positive `initial_quantity` is booked as a
    /// `MANUAL` adjustment so the history replays to the starting quantity.
    pub fn register_product(
        &self,
        product_id: ProductId,
        min_threshold: i64,
        initial_quantity: i64,
    ) -> InventoryResult<StockRecord> {
        if initial_quantity < 0 {
            return Err(InventoryError::invalid_argument("initial quantity cannot be negative"));
        }

        let slot = self.locks.slot(&product_id)?;
        let _guard = acquire(&slot);

        let now = Utc::now();
        let mut record = StockRecord::new(product_id, min_threshold, now)?;
        let events = if initial_quantity > 0 {
            let cmd = AdjustStock {
                product_id,
                delta: initial_quantity,
                reason: AdjustmentReason::Manual,
                requested_at: now,
            };
            execute(&mut record, &cmd)?
        } else {
            Vec::new()
        };

        let history = events.iter().map(AdjustmentRecord::from).collect();
        self.store
            .insert(record.clone(), history)
            .map_err(|e| match e {
                StoreError::AlreadyExists(_) => InventoryError::ProductAlreadyExists(product_id),
                other => other.into(),
            })?;

        self.cache.refresh(&record);
        self.publish_all(&events);
        info!(product_id = %product_id, quantity = initial_quantity, min_threshold, "product registered");
        Ok(record)
    }

    /// Apply a signed delta. Returns the new quantity.
    pub fn adjust(&self, product_id: ProductId, delta: i64, reason: AdjustmentReason) -> InventoryResult<i64> {
        if delta == 0 {
            return Err(InventoryError::invalid_argument("delta cannot be zero"));
        }

        let slot = self.locks.slot(&product_id)?;
        let _guard = acquire(&slot);

        let mut record = self.load_required(product_id)?;
        let expected_version = ExpectedVersion::Exact(record.version());
        let cmd = AdjustStock {
            product_id,
            delta,
            reason,
            requested_at: Utc::now(),
        };

        let events = execute(&mut record, &cmd).inspect_err(|err| {
            warn!(product_id = %product_id, delta, reason = %reason, error = %err, "adjustment rejected");
        })?;

        self.store.commit(vec![LedgerWrite {
            record: record.clone(),
            expected_version,
            history: events.iter().map(AdjustmentRecord::from).collect(),
        }])?;

        self.cache.refresh(&record);
        self.publish_all(&events);

        info!(
            product_id = %product_id,
            delta,
            reason = %reason,
            quantity = record.quantity(),
            "stock adjusted"
        );
        Ok(record.quantity())
    }

    /// Move stock between two products in one atomic commit.
    ///
    /// Both product locks are taken in id order, so opposing transfers
    /// cannot deadlock. Returns `(from_quantity, to_quantity)`.
    pub fn transfer(&self, from: ProductId, to: ProductId, quantity: i64) -> InventoryResult<(i64, i64)> {
        if quantity <= 0 {
            return Err(InventoryError::invalid_argument("transfer quantity must be positive"));
        }
        if from == to {
            return Err(InventoryError::invalid_argument("cannot transfer to the same product"));
        }

        let (first, second) = if from < to { (from, to) } else { (to, from) };
        let first_slot = self.locks.slot(&first)?;
        let second_slot = self.locks.slot(&second)?;
        let _first = acquire(&first_slot);
        let _second = acquire(&second_slot);

        let mut source = self.load_required(from)?;
        let mut target = self.load_required(to)?;
        let source_version = source.version();
        let target_version = target.version();
        let now = Utc::now();

        let out = execute(
            &mut source,
            &AdjustStock {
                product_id: from,
                delta: -quantity,
                reason: AdjustmentReason::Manual,
                requested_at: now,
            },
        )?;
        let incoming = execute(
            &mut target,
            &AdjustStock {
                product_id: to,
                delta: quantity,
                reason: AdjustmentReason::Manual,
                requested_at: now,
            },
        )?;

        self.store.commit(vec![
            LedgerWrite {
                record: source.clone(),
                expected_version: ExpectedVersion::Exact(source_version),
                history: out.iter().map(AdjustmentRecord::from).collect(),
            },
            LedgerWrite {
                record: target.clone(),
                expected_version: ExpectedVersion::Exact(target_version),
                history: incoming.iter().map(AdjustmentRecord::from).collect(),
            },
        ])?;

        self.cache.refresh(&source);
        self.cache.refresh(&target);
        self.publish_all(&out);
        self.publish_all(&incoming);

        info!(from = %from, to = %to, quantity, "stock transferred");
        Ok((source.quantity(), target.quantity()))
    }

    pub fn set_min_threshold(&self, product_id: ProductId, min_threshold: i64) -> InventoryResult<StockRecord> {
        let slot = self.locks.slot(&product_id)?;
        let _guard = acquire(&slot);

        let mut record = self.load_required(product_id)?;
        record.set_min_threshold(min_threshold)?;
        self.store.commit(vec![LedgerWrite {
            record: record.clone(),
            expected_version: ExpectedVersion::Exact(record.version()),
            history: Vec::new(),
        }])?;
        self.cache.refresh(&record);

        debug!(product_id = %product_id, min_threshold, "min threshold updated");
        Ok(record)
    }

    pub fn get_record(&self, product_id: ProductId) -> InventoryResult<StockRecord> {
        if let Some(record) = self.cache.get(product_id) {
            return Ok(record);
        }
        let record = self.load_required(product_id)?;
        self.cache.fill(&record);
        Ok(record)
    }

    pub fn get_quantity(&self, product_id: ProductId) -> InventoryResult<i64> {
        self.get_record(product_id).map(|r| r.quantity())
    }

    /// Products with `quantity < threshold`. The snapshot may be slightly stale.
    pub fn list_low_stock(&self, threshold: i64) -> InventoryResult<Vec<StockRecord>> {
        let records = self.store.scan()?;
        Ok(records.into_iter().filter(|r| r.quantity() < threshold).collect())
    }

    /// Products below their own reorder threshold.
    pub fn list_below_min_threshold(&self) -> InventoryResult<Vec<StockRecord>> {
        let records = self.store.scan()?;
        Ok(records.into_iter().filter(StockRecord::is_below_min_threshold).collect())
    }

    pub fn products(&self) -> InventoryResult<Vec<StockRecord>> {
        Ok(self.store.scan()?)
    }

    /// Adjustment history, oldest first.
    pub fn history(&self, product_id: ProductId) -> InventoryResult<Vec<AdjustmentRecord>> {
        self.load_required(product_id)?;
        Ok(self.store.history(product_id)?)
    }

    /// Check that the stored quantity equals the sum of its history.
    pub fn verify_replay(&self, product_id: ProductId) -> InventoryResult<i64> {
        let slot = self.locks.slot(&product_id)?;
        let _guard = acquire(&slot);

        let record = self.load_required(product_id)?;
        let replayed = replay(&self.store.history(product_id)?);
        if replayed != record.quantity() {
            return Err(InventoryError::ReplayMismatch {
                product_id,
                stored: record.quantity(),
                replayed,
            });
        }
        Ok(replayed)
    }

    fn load_required(&self, product_id: ProductId) -> InventoryResult<StockRecord> {
        self.store
            .load(product_id)?
            .ok_or(InventoryError::ProductNotFound(product_id))
    }

    fn publish_all(&self, events: &[StockAdjusted]) {
        for event in events {
            let key = Some(event.product_id.to_string());
            if let Err(err) = publish_event(self.publisher.as_ref(), channels::INVENTORY_EVENTS, key, event) {
                // The change is already committed; the outbox is the only
                // thing that can fail here and it reports loudly on its own.
                warn!(product_id = %event.product_id, error = %err, "failed to record inventory change event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::thread;

    use stockwise_events::BusMessage;

    use crate::publisher::PublishError;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<BusMessage>>);

    impl Publisher for Recorder {
        fn publish(&self, message: BusMessage) -> Result<(), PublishError> {
            self.0.lock().unwrap().push(message);
            Ok(())
        }
    }

    fn ledger() -> (StockLedger, Arc<InMemoryLedgerStore>, Arc<Recorder>) {
        let store = Arc::new(InMemoryLedgerStore::new());
        let recorder = Arc::new(Recorder::default());
        let ledger = StockLedger::new(store.clone(), recorder.clone());
        (ledger, store, recorder)
    }

    #[test]
    fn overdraw_fails_and_keeps_quantity() {
        let (ledger, _, _) = ledger();
        let p = ProductId::new();
        ledger.register_product(p, 5, 10).unwrap();

        let err = ledger.adjust(p, -15, AdjustmentReason::Manual).unwrap_err();

        assert!(matches!(err, InventoryError::InsufficientStock { available: 10, requested: 15, .. }));
        assert_eq!(ledger.get_quantity(p).unwrap(), 10);
        assert_eq!(ledger.history(p).unwrap().len(), 1);
    }

    #[test]
    fn fulfilment_to_zero_appends_one_record_and_publishes() {
        let (ledger, _, recorder) = ledger();
        let p = ProductId::new();
        ledger.register_product(p, 5, 10).unwrap();

        assert_eq!(ledger.adjust(p, -10, AdjustmentReason::OrderFulfilled).unwrap(), 0);

        let history = ledger.history(p).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].reason, AdjustmentReason::OrderFulfilled);
        assert_eq!(history[1].resulting_quantity, 0);

        let published = recorder.0.lock().unwrap();
        let last: StockAdjusted = published.last().unwrap().decode().unwrap();
        assert_eq!(published.last().unwrap().channel(), channels::INVENTORY_EVENTS);
        assert_eq!(last.delta, -10);
        assert_eq!(last.resulting_quantity, Some(0));
    }

    #[test]
    fn unknown_product_and_zero_delta_are_rejected() {
        let (ledger, _, _) = ledger();
        let p = ProductId::new();

        assert_eq!(
            ledger.adjust(p, 1, AdjustmentReason::Manual),
            Err(InventoryError::ProductNotFound(p))
        );
        ledger.register_product(p, 0, 0).unwrap();
        assert!(matches!(
            ledger.adjust(p, 0, AdjustmentReason::Manual),
            Err(InventoryError::InvalidArgument(_))
        ));
        assert!(ledger.history(p).unwrap().is_empty());
    }

    #[test]
    fn duplicate_registration_is_a_conflict() {
        let (ledger, _, _) = ledger();
        let p = ProductId::new();
        ledger.register_product(p, 0, 1).unwrap();

        assert_eq!(
            ledger.register_product(p, 0, 1).unwrap_err(),
            InventoryError::ProductAlreadyExists(p)
        );
    }

    #[test]
    fn storage_outage_is_retryable_and_changes_nothing() {
        let (ledger, store, recorder) = ledger();
        let p = ProductId::new();
        ledger.register_product(p, 0, 4).unwrap();
        let published_before = recorder.0.lock().unwrap().len();

        store.set_available(false);
        let err = ledger.adjust(p, -1, AdjustmentReason::Manual).unwrap_err();
        assert!(err.is_retryable());

        store.set_available(true);
        assert_eq!(ledger.get_quantity(p).unwrap(), 4);
        assert_eq!(recorder.0.lock().unwrap().len(), published_before);
    }

    #[test]
    fn transfer_moves_stock_atomically() {
        let (ledger, _, _) = ledger();
        let a = ProductId::new();
        let b = ProductId::new();
        ledger.register_product(a, 0, 10).unwrap();
        ledger.register_product(b, 0, 1).unwrap();

        assert_eq!(ledger.transfer(a, b, 4).unwrap(), (6, 5));

        let err = ledger.transfer(a, b, 7).unwrap_err();
        assert!(matches!(err, InventoryError::InsufficientStock { .. }));
        assert_eq!(ledger.get_quantity(a).unwrap(), 6);
        assert_eq!(ledger.get_quantity(b).unwrap(), 5);
        assert_eq!(ledger.verify_replay(a).unwrap(), 6);
        assert_eq!(ledger.verify_replay(b).unwrap(), 5);
    }

    #[test]
    fn low_stock_queries() {
        let (ledger, _, _) = ledger();
        let low = ProductId::new();
        let ok = ProductId::new();
        ledger.register_product(low, 10, 3).unwrap();
        ledger.register_product(ok, 2, 8).unwrap();

        let below: Vec<_> = ledger
            .list_below_min_threshold()
            .unwrap()
            .iter()
            .map(StockRecord::product_id)
            .collect();
        assert_eq!(below, vec![low]);
        assert_eq!(ledger.list_low_stock(9).unwrap().len(), 2);
        assert_eq!(ledger.list_low_stock(3).unwrap().len(), 0);

        ledger.set_min_threshold(ok, 20).unwrap();
        assert_eq!(ledger.list_below_min_threshold().unwrap().len(), 2);
        assert_eq!(ledger.get_record(ok).unwrap().min_threshold(), 20);
    }

    #[test]
    fn concurrent_adjustments_lose_no_updates() {
        let (ledger, _, _) = ledger();
        let ledger = Arc::new(ledger);
        let p = ProductId::new();
        ledger.register_product(p, 0, 1_000).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    for n in 0..50 {
                        let delta = if (i + n) % 2 == 0 { 3 } else { -2 };
                        ledger.adjust(p, delta, AdjustmentReason::Manual).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // 8 threads x 25 x (+3 - 2)
        assert_eq!(ledger.get_quantity(p).unwrap(), 1_000 + 200);
        assert_eq!(ledger.verify_replay(p).unwrap(), 1_200);
        let history = ledger.history(p).unwrap();
        assert!(history.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }
}
