//! An in-memory implementation of [`KvStore`].
//!
//! This implementation is useful for testing, and for portals that never need
//! to share state with another process. Clones share the same underlying map.
use std::sync::Arc;

use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};

use super::{KvStore, SetOutcome, StoreKey, WriteMode};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct InMemoryStore {
    entries: Arc<DashMap<StoreKey, Bytes>>,
    mode: WriteMode,
}

impl InMemoryStore {
    pub fn new(mode: WriteMode) -> Self {
        Self {
            entries: Default::default(),
            mode,
        }
    }
}

impl KvStore for InMemoryStore {
    fn mode(&self) -> WriteMode {
        self.mode
    }

    fn get(&self, key: &StoreKey) -> Result<Option<Bytes>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    fn set(&self, key: &StoreKey, value: &[u8]) -> Result<SetOutcome> {
        match (self.entries.entry(key.clone()), self.mode) {
            (Entry::Occupied(_), WriteMode::Immutable) => Ok(SetOutcome::Kept),
            (Entry::Occupied(mut entry), WriteMode::Mutable) => {
                entry.insert(Bytes::copy_from_slice(value));
                Ok(SetOutcome::Written)
            }
            (Entry::Vacant(entry), _) => {
                entry.insert(Bytes::copy_from_slice(value));
                Ok(SetOutcome::Written)
            }
        }
    }

    fn contains(&self, key: &StoreKey) -> Result<bool> {
        Ok(self.entries.contains_key(key))
    }

    fn delete(&self, key: &StoreKey) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    fn keys(&self, prefix: &StoreKey) -> Result<Vec<StoreKey>> {
        let mut keys: Vec<_> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn clear(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}
