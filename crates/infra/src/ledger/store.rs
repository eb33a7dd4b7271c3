//! Persistence boundary for stock records and their adjustment history.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use stockwise_core::{AggregateRoot, ExpectedVersion, ProductId};
use stockwise_inventory::{AdjustmentRecord, StockRecord};

use crate::store::StoreError;

/// One record update in a commit batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerWrite {
    /// New state of the record.
    pub record: StockRecord,
    /// Version the stored record must have before this write.
    pub expected_version: ExpectedVersion,
    /// History entries produced by the change (may be empty).
    pub history: Vec<AdjustmentRecord>,
}

/// Storage for the ledger.
///
/// `commit` is all-or-nothing across the whole batch: either every record is
/// replaced and every history entry appended, or nothing changes.
pub trait LedgerStore: Send + Sync {
    fn insert(&self, record: StockRecord, history: Vec<AdjustmentRecord>) -> Result<(), StoreError>;

    fn load(&self, product_id: ProductId) -> Result<Option<StockRecord>, StoreError>;

    fn commit(&self, batch: Vec<LedgerWrite>) -> Result<(), StoreError>;

    /// History for one product, oldest first.
    fn history(&self, product_id: ProductId) -> Result<Vec<AdjustmentRecord>, StoreError>;

    /// Point-in-time snapshot of every record.
    fn scan(&self) -> Result<Vec<StockRecord>, StoreError>;
}

impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    fn insert(&self, record: StockRecord, history: Vec<AdjustmentRecord>) -> Result<(), StoreError> {
        (**self).insert(record, history)
    }

    fn load(&self, product_id: ProductId) -> Result<Option<StockRecord>, StoreError> {
        (**self).load(product_id)
    }

    fn commit(&self, batch: Vec<LedgerWrite>) -> Result<(), StoreError> {
        (**self).commit(batch)
    }

    fn history(&self, product_id: ProductId) -> Result<Vec<AdjustmentRecord>, StoreError> {
        (**self).history(product_id)
    }

    fn scan(&self) -> Result<Vec<StockRecord>, StoreError> {
        (**self).scan()
    }
}

#[derive(Debug, Default)]
struct Tables {
    records: HashMap<ProductId, StockRecord>,
    history: HashMap<ProductId, Vec<AdjustmentRecord>>,
}

/// In-memory ledger store.
///
/// Intended for tests/dev and single-process deployments. Can be switched
/// offline to exercise outage handling.
#[derive(Debug)]
pub struct InMemoryLedgerStore {
    tables: RwLock<Tables>,
    available: AtomicBool,
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("ledger store offline".to_string()))
        }
    }
}

impl LedgerStore for InMemoryLedgerStore {
    fn insert(&self, record: StockRecord, history: Vec<AdjustmentRecord>) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut tables = self.tables.write().map_err(|_| StoreError::poisoned())?;

        let product_id = record.product_id();
        if tables.records.contains_key(&product_id) {
            return Err(StoreError::AlreadyExists(product_id.to_string()));
        }
        tables.records.insert(product_id, record);
        tables.history.insert(product_id, history);
        Ok(())
    }

    fn load(&self, product_id: ProductId) -> Result<Option<StockRecord>, StoreError> {
        self.ensure_available()?;
        let tables = self.tables.read().map_err(|_| StoreError::poisoned())?;
        Ok(tables.records.get(&product_id).cloned())
    }

    fn commit(&self, batch: Vec<LedgerWrite>) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut tables = self.tables.write().map_err(|_| StoreError::poisoned())?;

        // Validate the whole batch before touching anything.
        for write in &batch {
            let product_id = write.record.product_id();
            let current = tables
                .records
                .get(&product_id)
                .ok_or_else(|| StoreError::NotFound(product_id.to_string()))?;
            if !write.expected_version.matches(current.version()) {
                return Err(StoreError::Concurrency(format!(
                    "{product_id}: expected {:?}, found {}",
                    write.expected_version,
                    current.version()
                )));
            }
        }

        for write in batch {
            let product_id = write.record.product_id();
            tables
                .history
                .entry(product_id)
                .or_default()
                .extend(write.history);
            tables.records.insert(product_id, write.record);
        }
        Ok(())
    }

    fn history(&self, product_id: ProductId) -> Result<Vec<AdjustmentRecord>, StoreError> {
        self.ensure_available()?;
        let tables = self.tables.read().map_err(|_| StoreError::poisoned())?;
        Ok(tables.history.get(&product_id).cloned().unwrap_or_default())
    }

    fn scan(&self) -> Result<Vec<StockRecord>, StoreError> {
        self.ensure_available()?;
        let tables = self.tables.read().map_err(|_| StoreError::poisoned())?;
        let mut records: Vec<_> = tables.records.values().cloned().collect();
        records.sort_by_key(|r| r.product_id());
        Ok(records)
    }
}
