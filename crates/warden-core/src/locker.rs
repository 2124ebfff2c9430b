//! Per-key mutual exclusion
//!
//! Maps account paths to mutexes so that rule evaluation, slashing-state
//! persistence, and signing form one critical section per account. Mutexes
//! are created on first use and never removed; the registry is bounded by
//! the number of accounts.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub struct Locker {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Locker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the mutex for a key, waiting if it is held
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        mutex.lock_owned().await
    }

    /// Number of keys ever locked
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}
