//! Storage abstraction for ratchet state
//!
//! A versioned key-value store. Every stateful entity (state vector, session,
//! relationship, manager, store index) serializes itself under a
//! deterministic key derived from its identity. The trait is synchronous (no
//! async): writes happen while the owning object's lock is held, so a write
//! that returns `Ok` is durable before the mutation becomes observable.

mod chaotic;
mod error;
mod memory;
mod redb;

pub use chaotic::ChaoticStorage;
pub use error::StorageError;
pub use memory::MemoryStorage;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

pub use self::redb::RedbStorage;

/// A stored value with its format version and write time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    /// Format version the data was written with.
    pub version: u64,
    /// Unix timestamp (seconds) of the write.
    pub timestamp_secs: u64,
    /// Encoded value.
    pub data: Vec<u8>,
}

/// Storage abstraction for ratchet state
///
/// Must be Clone (shared by every session, relationship and manager), Send +
/// Sync (thread-safe), and synchronous (no async methods). Implementations
/// share internal state via Arc, so clones access the same underlying
/// storage.
///
/// # Panics
///
/// Implementations may panic if internal synchronization primitives are
/// poisoned (a thread panicked while holding a lock). Acceptable for
/// test/simulation code, but production implementations should handle poisoned
/// mutexes gracefully.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Load the object under `key`.
    ///
    /// Returns `None` if nothing is stored. Returns
    /// `StorageError::VersionMismatch` if the stored object has a different
    /// version.
    fn get(&self, key: &str, version: u64) -> Result<Option<StoredObject>, StorageError>;

    /// Store `data` under `key`, replacing any previous object.
    ///
    /// # Invariants
    ///
    /// - Post: a subsequent `get(key, version)` returns `data`
    fn set(&self, key: &str, version: u64, data: &[u8]) -> Result<(), StorageError>;

    /// Remove the object under `key`.
    ///
    /// Idempotent: deleting a missing key succeeds.
    fn delete(&self, key: &str, version: u64) -> Result<(), StorageError>;
}

/// Serialize `value` as CBOR and store it.
pub fn save_cbor<S: Storage, T: Serialize>(
    storage: &S,
    key: &str,
    version: u64,
    value: &T,
) -> Result<(), StorageError> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    storage.set(key, version, &buf)
}

/// Load and decode a CBOR value, failing with `NotFound` if absent.
pub fn load_cbor<S: Storage, T: DeserializeOwned>(
    storage: &S,
    key: &str,
    version: u64,
) -> Result<T, StorageError> {
    let object =
        storage.get(key, version)?.ok_or_else(|| StorageError::NotFound { key: key.to_string() })?;
    ciborium::de::from_reader(object.data.as_slice())
        .map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Check the version of a loaded object against the requested one.
fn check_version(key: &str, expected: u64, object: &StoredObject) -> Result<(), StorageError> {
    if object.version != expected {
        return Err(StorageError::VersionMismatch {
            key: key.to_string(),
            expected,
            found: object.version,
        });
    }
    Ok(())
}

/// Wall-clock seconds for object timestamps.
#[allow(clippy::disallowed_methods)]
fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn cbor_helpers_roundtrip() {
        let storage = MemoryStorage::new();
        let sample = Sample { name: "alice".to_string(), count: 3 };

        save_cbor(&storage, "sample", 1, &sample).unwrap();
        let loaded: Sample = load_cbor(&storage, "sample", 1).unwrap();

        assert_eq!(loaded, sample);
    }

    #[test]
    fn missing_key_is_not_found() {
        let storage = MemoryStorage::new();

        let result: Result<Sample, _> = load_cbor(&storage, "missing", 0);

        assert_eq!(result, Err(StorageError::NotFound { key: "missing".to_string() }));
    }

    #[test]
    fn version_mismatch_is_reported() {
        let storage = MemoryStorage::new();
        storage.set("k", 1, b"data").unwrap();

        let result = storage.get("k", 2);

        assert_eq!(
            result,
            Err(StorageError::VersionMismatch { key: "k".to_string(), expected: 2, found: 1 })
        );
    }
}
