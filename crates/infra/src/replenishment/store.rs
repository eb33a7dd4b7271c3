use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use stockwise_core::{ProductId, ReplenishmentOrderId};
use stockwise_inventory::ReplenishmentOrder;

use crate::store::StoreError;

/// Persistence for replenishment orders. `save` upserts by order id.
pub trait ReplenishmentOrderStore: Send + Sync {
    fn save(&self, order: ReplenishmentOrder) -> Result<(), StoreError>;

    fn get(&self, id: ReplenishmentOrderId) -> Result<Option<ReplenishmentOrder>, StoreError>;

    /// Oldest first.
    fn list(&self) -> Result<Vec<ReplenishmentOrder>, StoreError>;

    fn list_for_product(&self, product_id: ProductId) -> Result<Vec<ReplenishmentOrder>, StoreError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|o| o.product_id() == product_id)
            .collect())
    }
}

#[derive(Debug)]
pub struct InMemoryReplenishmentOrderStore {
    orders: RwLock<HashMap<ReplenishmentOrderId, ReplenishmentOrder>>,
    available: AtomicBool,
}

impl Default for InMemoryReplenishmentOrderStore {
    fn default() -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryReplenishmentOrderStore {
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
            Err(StoreError::Unavailable("replenishment store offline".to_string()))
        }
    }
}

impl ReplenishmentOrderStore for InMemoryReplenishmentOrderStore {
    fn save(&self, order: ReplenishmentOrder) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut orders = self.orders.write().map_err(|_| StoreError::poisoned())?;
        orders.insert(order.id(), order);
        Ok(())
    }

    fn get(&self, id: ReplenishmentOrderId) -> Result<Option<ReplenishmentOrder>, StoreError> {
        self.ensure_available()?;
        let orders = self.orders.read().map_err(|_| StoreError::poisoned())?;
        Ok(orders.get(&id).cloned())
    }

    fn list(&self) -> Result<Vec<ReplenishmentOrder>, StoreError> {
        self.ensure_available()?;
        let orders = self.orders.read().map_err(|_| StoreError::poisoned())?;
        let mut all: Vec<_> = orders.values().cloned().collect();
        all.sort_by_key(|o| o.created_at());
        Ok(all)
    }
}
