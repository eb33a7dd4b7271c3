use std::collections::HashMap;
use std::sync::RwLock;

use stockwise_core::{AggregateRoot, ProductId};
use stockwise_inventory::StockRecord;

/// Read-through cache of stock records.
///
/// The ledger's write path calls [`refresh`](Self::refresh) while it still
/// holds the product lock. Readers that miss load from the store and call
/// [`fill`](Self::fill), which only installs a record strictly newer than the
/// cached one, so a slow reader can never put back a state that a writer has
/// already replaced.
#[derive(Debug, Default)]
pub struct StockCache {
    entries: RwLock<HashMap<ProductId, StockRecord>>,
}

impl StockCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, product_id: ProductId) -> Option<StockRecord> {
        self.entries
            .read()
            .ok()
            .and_then(|e| e.get(&product_id).cloned())
    }

    /// Install a record loaded by a reader.
    pub fn fill(&self, record: &StockRecord) {
        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        match entries.get(&record.product_id()) {
            Some(cached) if cached.version() >= record.version() => {}
            _ => {
                entries.insert(record.product_id(), record.clone());
            }
        }
    }

    /// Install a record just committed by the write path.
    pub fn refresh(&self, record: &StockRecord) {
        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        match entries.get(&record.product_id()) {
            Some(cached) if cached.version() > record.version() => {}
            _ => {
                entries.insert(record.product_id(), record.clone());
            }
        }
    }

    pub fn invalidate(&self, product_id: ProductId) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(&product_id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stockwise_core::execute;
    use stockwise_inventory::{AdjustStock, AdjustmentReason};

    fn bump(record: &mut StockRecord) {
        execute(
            record,
            &AdjustStock {
                product_id: record.product_id(),
                delta: 1,
                reason: AdjustmentReason::Manual,
                requested_at: Utc::now(),
            },
        )
        .unwrap();
    }

    #[test]
    fn stale_fill_does_not_overwrite_refresh() {
        let cache = StockCache::new();
        let mut record = StockRecord::new(ProductId::new(), 0, Utc::now()).unwrap();
        let stale = record.clone();
        bump(&mut record);

        cache.refresh(&record);
        cache.fill(&stale);

        assert_eq!(cache.get(record.product_id()).unwrap().quantity(), 1);
    }

    #[test]
    fn refresh_replaces_same_version() {
        let cache = StockCache::new();
        let mut record = StockRecord::new(ProductId::new(), 0, Utc::now()).unwrap();
        cache.fill(&record);

        record.set_min_threshold(9).unwrap();
        cache.refresh(&record);
        assert_eq!(cache.get(record.product_id()).unwrap().min_threshold(), 9);

        cache.invalidate(record.product_id());
        assert!(cache.is_empty());
    }
}
