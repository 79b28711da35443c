//! An async mutex keyed by an arbitrary value.
//!
//! Holding the guard for key `k` excludes every other task from acquiring `k`, while tasks holding other keys proceed
//! in parallel. Entries are removed from the map as soon as nobody holds or waits on them, so the map only ever
//! contains keys that are currently in use.
use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex},
};

use log::*;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap<K> = Arc<Mutex<HashMap<K, Arc<AsyncMutex<()>>>>>;

#[derive(Debug)]
pub struct KeyedLock<K> {
    locks: LockMap<K>,
}

impl<K> Clone for KeyedLock<K> {
    fn clone(&self) -> Self {
        Self { locks: Arc::clone(&self.locks) }
    }
}

impl<K> Default for KeyedLock<K> {
    fn default() -> Self {
        Self { locks: Arc::new(Mutex::new(HashMap::new())) }
    }
}

impl<K: Eq + Hash + Clone> KeyedLock<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &K) -> KeyedGuard<K> {
        let mutex = {
            let mut map = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(map.entry(key.clone()).or_default())
        };
        let guard = mutex.lock_owned().await;
        KeyedGuard { key: key.clone(), guard: Some(guard), locks: Arc::clone(&self.locks) }
    }

    /// The number of keys that are currently locked or being waited on.
    pub fn active_keys(&self) -> usize {
        self.locks.lock().map(|m| m.len()).unwrap_or_default()
    }
}

pub struct KeyedGuard<K: Eq + Hash> {
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockMap<K>,
}

impl<K: Eq + Hash> Drop for KeyedGuard<K> {
    fn drop(&mut self) {
        // Release the mutex before inspecting the reference count, otherwise the guard's own reference is counted.
        drop(self.guard.take());
        match self.locks.lock() {
            Ok(mut map) => {
                if map.get(&self.key).is_some_and(|m| Arc::strong_count(m) == 1) {
                    map.remove(&self.key);
                }
            },
            Err(e) => error!("Keyed lock map is poisoned: {e}"),
        }
    }
}
