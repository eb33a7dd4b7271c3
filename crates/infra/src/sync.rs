use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::store::StoreError;

/// One exclusive lock per key.
///
/// Writers on the same key serialize; writers on different keys never wait on
/// each other beyond the brief map lookup.
#[derive(Debug)]
pub struct KeyedLocks<K> {
    slots: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock slot for `key`, created on first use.
    pub fn slot(&self, key: &K) -> Result<Arc<Mutex<()>>, StoreError> {
        let mut slots = self.slots.lock().map_err(|_| StoreError::poisoned())?;
        Ok(Arc::clone(slots.entry(key.clone()).or_default()))
    }

    /// Drop the slot for `key` once nobody holds or waits on it. Call after
    /// releasing your own handle to keep the map bounded by live keys.
    pub fn prune(&self, key: &K) {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        if slots.get(key).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            slots.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().map_or(0, |slots| slots.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Acquire a slot. The guarded value is `()`, so a panic in a previous holder
/// leaves nothing inconsistent behind and poisoning is ignored.
pub fn acquire(slot: &Mutex<()>) -> MutexGuard<'_, ()> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn same_key_shares_a_slot() {
        let locks = KeyedLocks::<u32>::new();
        let a = locks.slot(&1).unwrap();
        let b = locks.slot(&1).unwrap();
        let c = locks.slot(&2).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn prune_keeps_slots_that_are_still_held() {
        let locks = KeyedLocks::<u32>::new();
        let held = locks.slot(&1).unwrap();

        locks.prune(&1);
        assert_eq!(locks.len(), 1);
        assert!(Arc::ptr_eq(&held, &locks.slot(&1).unwrap()));

        drop(held);
        locks.prune(&1);
        assert!(locks.is_empty());
    }

    #[test]
    fn same_key_is_mutually_exclusive() {
        let locks = Arc::new(KeyedLocks::<u32>::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    let slot = locks.slot(&7).unwrap();
                    let _g = acquire(&slot);
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(2));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
