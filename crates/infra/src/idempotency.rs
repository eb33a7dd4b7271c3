//! Deduplication of at-least-once deliveries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use stockwise_core::{EventId, InventoryError, InventoryResult};

use crate::store::StoreError;

/// A row in the processed-event set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedEvent {
    pub event_id: EventId,
    pub processed_at: DateTime<Utc>,
}

/// Backing set for the guard. `insert_if_absent` must be atomic: under
/// concurrent calls with the same id exactly one observes `true`.
pub trait ProcessedEventStore: Send + Sync {
    fn insert_if_absent(&self, event: ProcessedEvent) -> Result<bool, StoreError>;

    fn remove(&self, event_id: &EventId) -> Result<bool, StoreError>;

    fn contains(&self, event_id: &EventId) -> Result<bool, StoreError>;

    /// Delete rows processed before `cutoff`; returns how many were removed.
    fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

#[derive(Debug)]
pub struct InMemoryProcessedEventStore {
    rows: Mutex<HashMap<EventId, DateTime<Utc>>>,
    available: AtomicBool,
}

impl Default for InMemoryProcessedEventStore {
    fn default() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryProcessedEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.rows.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn rows(&self) -> Result<std::sync::MutexGuard<'_, HashMap<EventId, DateTime<Utc>>>, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("processed-event store offline".to_string()));
        }
        self.rows.lock().map_err(|_| StoreError::poisoned())
    }
}

impl ProcessedEventStore for InMemoryProcessedEventStore {
    fn insert_if_absent(&self, event: ProcessedEvent) -> Result<bool, StoreError> {
        let mut rows = self.rows()?;
        if rows.contains_key(&event.event_id) {
            return Ok(false);
        }
        rows.insert(event.event_id, event.processed_at);
        Ok(true)
    }

    fn remove(&self, event_id: &EventId) -> Result<bool, StoreError> {
        Ok(self.rows()?.remove(event_id).is_some())
    }

    fn contains(&self, event_id: &EventId) -> Result<bool, StoreError> {
        Ok(self.rows()?.contains_key(event_id))
    }

    fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut rows = self.rows()?;
        let before = rows.len();
        rows.retain(|_, processed_at| *processed_at >= cutoff);
        Ok(before - rows.len())
    }
}

/// Lets each distinct event id through once.
///
/// If the backing store cannot be reached the guard fails with
/// `GuardUnavailable`; it never guesses.
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn ProcessedEventStore>,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn ProcessedEventStore>) -> Self {
        Self { store }
    }

    /// `true` exactly once per distinct id.
    pub fn admit(&self, event_id: &EventId) -> InventoryResult<bool> {
        let admitted = self
            .store
            .insert_if_absent(ProcessedEvent {
                event_id: event_id.clone(),
                processed_at: Utc::now(),
            })
            .map_err(unavailable)?;

        if !admitted {
            debug!(event_id = %event_id, "duplicate event dropped");
        }
        Ok(admitted)
    }

    /// Forget an admitted id so a redelivery is processed again. Used when
    /// processing failed for infrastructure reasons after admission.
    pub fn release(&self, event_id: &EventId) -> InventoryResult<()> {
        self.store.remove(event_id).map_err(unavailable)?;
        debug!(event_id = %event_id, "event released for redelivery");
        Ok(())
    }

    pub fn is_processed(&self, event_id: &EventId) -> InventoryResult<bool> {
        self.store.contains(event_id).map_err(unavailable)
    }

    /// Drop rows older than `retention`.
    pub fn prune(&self, retention: Duration) -> InventoryResult<usize> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| InventoryError::invalid_argument(format!("retention out of range: {e}")))?;
        let cutoff = Utc::now() - retention;
        let removed = self.store.prune_before(cutoff).map_err(unavailable)?;
        if removed > 0 {
            debug!(removed, "pruned processed events");
        }
        Ok(removed)
    }
}

fn unavailable(err: StoreError) -> InventoryError {
    warn!(error = %err, "idempotency guard unavailable");
    InventoryError::guard_unavailable(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn guard() -> (IdempotencyGuard, Arc<InMemoryProcessedEventStore>) {
        let store = Arc::new(InMemoryProcessedEventStore::new());
        (IdempotencyGuard::new(store.clone()), store)
    }

    #[test]
    fn admits_each_id_once() {
        let (guard, _) = guard();
        let id = EventId::new("e1");

        assert!(guard.admit(&id).unwrap());
        assert!(!guard.admit(&id).unwrap());
        assert!(!guard.admit(&id).unwrap());
        assert!(guard.admit(&EventId::new("e2")).unwrap());
    }

    #[test]
    fn concurrent_admission_has_one_winner() {
        let (guard, _) = guard();
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let guard = guard.clone();
                let winners = Arc::clone(&winners);
                thread::spawn(move || {
                    if guard.admit(&EventId::new("same")).unwrap() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn outage_fails_loudly() {
        let (guard, store) = guard();
        store.set_available(false);

        let err = guard.admit(&EventId::new("e1")).unwrap_err();
        assert!(matches!(err, InventoryError::GuardUnavailable(_)));
        assert!(err.is_retryable());

        store.set_available(true);
        assert!(guard.admit(&EventId::new("e1")).unwrap());
    }

    #[test]
    fn release_allows_redelivery() {
        let (guard, _) = guard();
        let id = EventId::new("e1");
        guard.admit(&id).unwrap();

        guard.release(&id).unwrap();

        assert!(!guard.is_processed(&id).unwrap());
        assert!(guard.admit(&id).unwrap());
    }

    #[test]
    fn prune_removes_only_old_rows() {
        let (guard, store) = guard();
        store
            .insert_if_absent(ProcessedEvent {
                event_id: EventId::new("old"),
                processed_at: Utc::now() - chrono::Duration::hours(200),
            })
            .unwrap();
        guard.admit(&EventId::new("fresh")).unwrap();

        assert_eq!(guard.prune(Duration::from_secs(168 * 3600)).unwrap(), 1);
        assert_eq!(store.len(), 1);
        assert!(guard.is_processed(&EventId::new("fresh")).unwrap());
    }
}
