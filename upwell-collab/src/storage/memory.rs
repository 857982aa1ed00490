//! In-process store, used for tests and as a stand-in remote.

use std::collections::BTreeMap;
use std::sync::RwLock;

use super::{Storage, StoreError};

#[derive(Debug, Default)]
pub struct MemoryStore {
    items: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.read().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::DatabaseError("memory store lock poisoned".into())
}

impl Storage for MemoryStore {
    fn get_item(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.items.read().map_err(poisoned)?.get(id).cloned())
    }

    fn set_item(&self, id: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.items
            .write()
            .map_err(poisoned)?
            .insert(id.to_string(), bytes.to_vec());
        Ok(())
    }

    fn ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.items.read().map_err(poisoned)?.keys().cloned().collect())
    }
}
