//! Per-cluster-key async lock.
//!
//! Serializes the check, launch and store steps for one cluster key while
//! other keys proceed in parallel. Entries hold weak references and are
//! removed as soon as the last guard for a key is dropped.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = Arc<DashMap<String, Weak<Mutex<()>>>>;

/// Guard for one key; releases the lock and prunes the map entry on drop.
pub(crate) struct KeyGuard {
    guard: Option<OwnedMutexGuard<()>>,
    lock: Arc<Mutex<()>>,
    key: String,
    locks: LockMap,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only `self.lock` left means nobody holds or waits on this key.
        if Arc::strong_count(&self.lock) == 1 {
            self.locks.remove_if(&self.key, |_, weak| weak.strong_count() <= 1);
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct KeyedAsyncLock {
    locks: LockMap,
}

impl KeyedAsyncLock {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Waits until `key` is free and takes it.
    pub(crate) async fn lock(&self, key: &str) -> KeyGuard {
        let lock = self.get_or_create(key);
        let guard = Arc::clone(&lock).lock_owned().await;
        KeyGuard {
            guard: Some(guard),
            lock,
            key: key.to_string(),
            locks: Arc::clone(&self.locks),
        }
    }

    fn get_or_create(&self, key: &str) -> Arc<Mutex<()>> {
        match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if let Some(strong) = occupied.get().upgrade() {
                    return strong;
                }
                let strong = Arc::new(Mutex::new(()));
                occupied.insert(Arc::downgrade(&strong));
                strong
            }
            Entry::Vacant(vacant) => {
                let strong = Arc::new(Mutex::new(()));
                vacant.insert(Arc::downgrade(&strong));
                strong
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}
