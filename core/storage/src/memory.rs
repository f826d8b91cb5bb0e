//! In-memory resource store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use offgrid_common::{Error, Result};
use crate::provider::{CachedResponse, ResourceStore, StoreKey};

type Entries = HashMap<StoreKey, CachedResponse>;

/// In-memory resource store.
///
/// Useful for testing and short-lived workers. All data is stored in
/// memory and lost on drop. Every value lives behind a single lock, so a
/// put is observed whole or not at all.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<Entries>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.read().map(|entries| entries.len()).unwrap_or(0)
    }

    /// Whether the store holds no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Entries>> {
        self.entries
            .read()
            .map_err(|_| Error::Storage("Memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Entries>> {
        self.entries
            .write()
            .map_err(|_| Error::Storage("Memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &StoreKey) -> Result<Option<CachedResponse>> {
        Ok(self.read()?.get(key).cloned())
    }

    async fn put(&self, key: &StoreKey, value: CachedResponse) -> Result<()> {
        self.write()?.insert(key.clone(), value);
        Ok(())
    }

    async fn delete(&self, key: &StoreKey) -> Result<bool> {
        Ok(self.write()?.remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<StoreKey>> {
        let mut keys: Vec<StoreKey> = self.read()?.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}
