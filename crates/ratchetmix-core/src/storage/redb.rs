//! Durable storage on a single redb table.
//!
//! Every `set` and `delete` commits its own write transaction, so a key a
//! state vector hands out is durable before the caller sees it.

use std::{fmt::Display, path::Path, sync::Arc};

use redb::{Database, ReadableTable, Table, TableDefinition};

use super::{Storage, StorageError, StoredObject, check_version, now_secs};

/// Storage key (UTF-8) to CBOR-encoded [`StoredObject`].
const OBJECTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("objects");

fn backend(e: impl Display) -> StorageError {
    StorageError::Io(e.to_string())
}

fn decode(key: &str, version: u64, bytes: &[u8]) -> Result<StoredObject, StorageError> {
    let object: StoredObject =
        ciborium::de::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))?;
    check_version(key, version, &object)?;
    Ok(object)
}

/// Storage in a redb database file. Clones share the database.
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open the database at `path`, creating it and its table if absent.
    ///
    /// # Errors
    ///
    /// `StorageError::Io` if the file cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let storage = Self { db: Arc::new(Database::create(path.as_ref()).map_err(backend)?) };
        storage.write(|_| Ok(()))?;
        Ok(storage)
    }

    /// Run `f` against the table in one committed write transaction.
    fn write<T>(
        &self,
        f: impl FnOnce(&mut Table<'_, &'static [u8], &'static [u8]>) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let txn = self.db.begin_write().map_err(backend)?;
        let out = {
            let mut table = txn.open_table(OBJECTS).map_err(backend)?;
            f(&mut table)?
        };
        txn.commit().map_err(backend)?;
        Ok(out)
    }
}

impl Storage for RedbStorage {
    fn get(&self, key: &str, version: u64) -> Result<Option<StoredObject>, StorageError> {
        let txn = self.db.begin_read().map_err(backend)?;
        let table = txn.open_table(OBJECTS).map_err(backend)?;

        table
            .get(key.as_bytes())
            .map_err(backend)?
            .map(|value| decode(key, version, value.value()))
            .transpose()
    }

    fn set(&self, key: &str, version: u64, data: &[u8]) -> Result<(), StorageError> {
        let object = StoredObject { version, timestamp_secs: now_secs(), data: data.to_vec() };
        let mut encoded = Vec::with_capacity(data.len() + 32);
        ciborium::ser::into_writer(&object, &mut encoded)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        self.write(|table| {
            table.insert(key.as_bytes(), encoded.as_slice()).map_err(backend)?;
            Ok(())
        })
    }

    fn delete(&self, key: &str, version: u64) -> Result<(), StorageError> {
        self.write(|table| {
            let existing = table.get(key.as_bytes()).map_err(backend)?.map(|v| v.value().to_vec());
            if let Some(bytes) = existing {
                decode(key, version, &bytes)?;
                table.remove(key.as_bytes()).map_err(backend)?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ratchet.redb");

        {
            let storage = RedbStorage::open(&path).unwrap();
            storage.set("session/abc/state_vector", 1, b"bits").unwrap();
        }

        let storage = RedbStorage::open(&path).unwrap();
        let object = storage.get("session/abc/state_vector", 1).unwrap().unwrap();

        assert_eq!(object.data, b"bits");
        assert_eq!(object.version, 1);
    }

    #[test]
    fn delete_removes_object() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("ratchet.redb")).unwrap();

        storage.set("k", 0, b"v").unwrap();
        storage.delete("k", 0).unwrap();
        storage.delete("k", 0).unwrap();

        assert!(storage.get("k", 0).unwrap().is_none());
    }

    #[test]
    fn version_is_checked() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("ratchet.redb")).unwrap();

        storage.set("k", 3, b"v").unwrap();

        assert!(matches!(storage.get("k", 4), Err(StorageError::VersionMismatch { .. })));
    }
}
