//! Per-key serialization primitive shared by the dispatch engine, timer
//! service, and sweeper (spec §5: "all mutations touching a given fault or
//! vehicle must be serialized").
//!
//! A thin wrapper over `dashmap` (already in the pack's dependency tree via
//! `seanchatmangpt-knhk`) holding one `tokio::sync::Mutex<()>` per key,
//! created lazily. Cross-entity transitions acquire two keys; callers must
//! use [`crate::store::canonical_order`] to decide acquisition order and
//! avoid deadlock.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub struct KeyedMutexMap<K: Eq + Hash + Clone> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedMutexMap<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> KeyedMutexMap<K> {
    pub fn new() -> Self {
        Self { locks: DashMap::new() }
    }

    fn entry_for(&self, key: &K) -> Arc<Mutex<()>> {
        self.locks.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Acquire the lock for a single key.
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        self.entry_for(key).lock_owned().await
    }

    /// Acquire locks for two keys already in canonical order. Caller is
    /// responsible for ordering (see `store::canonical_order`).
    pub async fn lock_two(&self, first: &K, second: &K) -> (OwnedMutexGuard<()>, OwnedMutexGuard<()>) {
        let a = self.entry_for(first).lock_owned().await;
        let b = self.entry_for(second).lock_owned().await;
        (a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_key_serializes() {
        let map: KeyedMutexMap<u32> = KeyedMutexMap::new();
        let g1 = map.lock(&1).await;
        drop(g1);
        let _g2 = map.lock(&1).await;
    }
}
