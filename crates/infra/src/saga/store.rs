//! Persistence for orders driven by the saga coordinator.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use stockwise_core::{AggregateRoot, ExpectedVersion, OrderId};
use stockwise_orders::{Order, OrderItem};

use crate::store::StoreError;

/// An order plus the stock bookkeeping the saga needs to compensate it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaRecord {
    pub order: Order,
    /// Items that were decremented at some point during reservation.
    pub reserved: Vec<OrderItem>,
    /// Reserved items whose stock has not been given back yet.
    pub held: Vec<OrderItem>,
    /// Whether the per-item compensation events were emitted.
    pub compensation_published: bool,
}

impl SagaRecord {
    pub fn new(order: Order) -> Self {
        Self {
            order,
            reserved: Vec::new(),
            held: Vec::new(),
            compensation_published: false,
        }
    }
}

pub trait OrderStore: Send + Sync {
    fn insert(&self, record: SagaRecord) -> Result<(), StoreError>;

    fn load(&self, order_id: &OrderId) -> Result<Option<SagaRecord>, StoreError>;

    /// Replace the stored record if its order is still at `expected`.
    fn save(&self, record: SagaRecord, expected: ExpectedVersion) -> Result<(), StoreError>;

    fn list(&self) -> Result<Vec<SagaRecord>, StoreError>;
}

#[derive(Debug)]
pub struct InMemoryOrderStore {
    records: RwLock<HashMap<OrderId, SagaRecord>>,
    available: AtomicBool,
}

impl Default for InMemoryOrderStore {
    fn default() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryOrderStore {
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
            Err(StoreError::Unavailable("order store offline".to_string()))
        }
    }
}

impl OrderStore for InMemoryOrderStore {
    fn insert(&self, record: SagaRecord) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut records = self.records.write().map_err(|_| StoreError::poisoned())?;
        let id = record.order.id().clone();
        if records.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id.to_string()));
        }
        records.insert(id, record);
        Ok(())
    }

    fn load(&self, order_id: &OrderId) -> Result<Option<SagaRecord>, StoreError> {
        self.ensure_available()?;
        let records = self.records.read().map_err(|_| StoreError::poisoned())?;
        Ok(records.get(order_id).cloned())
    }

    fn save(&self, record: SagaRecord, expected: ExpectedVersion) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut records = self.records.write().map_err(|_| StoreError::poisoned())?;
        let id = record.order.id().clone();
        let current = records
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let actual = current.order.version();
        if !expected.matches(actual) {
            return Err(StoreError::Concurrency(format!(
                "order {id}: expected {expected:?}, found version {actual}"
            )));
        }
        records.insert(id, record);
        Ok(())
    }

    fn list(&self) -> Result<Vec<SagaRecord>, StoreError> {
        self.ensure_available()?;
        let records = self.records.read().map_err(|_| StoreError::poisoned())?;
        Ok(records.values().cloned().collect())
    }
}
