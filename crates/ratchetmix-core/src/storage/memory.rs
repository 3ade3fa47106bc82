//! Storage held in a process-local map.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]
#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    collections::{BTreeMap, btree_map::Entry},
    sync::{Arc, Mutex},
};

use super::{Storage, StorageError, StoredObject, check_version, now_secs};

/// Storage for tests and simulation. Clones share one map.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    objects: Arc<Mutex<BTreeMap<String, StoredObject>>>,
}

impl MemoryStorage {
    /// Empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.objects.lock().expect("memory storage poisoned").len()
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored keys starting with `prefix`, in order.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.objects
            .lock()
            .expect("memory storage poisoned")
            .range(prefix.to_string()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str, version: u64) -> Result<Option<StoredObject>, StorageError> {
        let objects = self.objects.lock().expect("memory storage poisoned");
        let Some(object) = objects.get(key) else {
            return Ok(None);
        };
        check_version(key, version, object)?;
        Ok(Some(object.clone()))
    }

    fn set(&self, key: &str, version: u64, data: &[u8]) -> Result<(), StorageError> {
        let object = StoredObject { version, timestamp_secs: now_secs(), data: data.to_vec() };
        self.objects.lock().expect("memory storage poisoned").insert(key.to_string(), object);
        Ok(())
    }

    fn delete(&self, key: &str, version: u64) -> Result<(), StorageError> {
        let mut objects = self.objects.lock().expect("memory storage poisoned");
        if let Entry::Occupied(entry) = objects.entry(key.to_string()) {
            check_version(key, version, entry.get())?;
            entry.remove();
        }
        Ok(())
    }
}
