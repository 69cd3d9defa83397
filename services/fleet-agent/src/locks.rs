//! Per-key async locks.
//!
//! Lifecycle operations on one tenant must not interleave (two concurrent
//! `run` calls would both see "absent" and race to create). Each key gets
//! its own mutex, created on first use and dropped once nobody holds or
//! waits for it.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Guard returned by [`KeyedLocks::lock`]; the key is unlocked on drop.
pub type KeyedGuard = OwnedMutexGuard<()>;

/// A set of async mutexes addressed by key.
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Wait until the key is free and lock it.
    pub async fn lock(&self, key: &K) -> KeyedGuard {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Only the map holds a reference: nobody is using or waiting on it.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(key.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Number of keys currently tracked.
    pub async fn tracked_keys(&self) -> usize {
        self.locks.lock().await.len()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}
