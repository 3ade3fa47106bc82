//! Storage failures.

use thiserror::Error;

/// A storage operation failed.
///
/// Every variant is fatal to the object being persisted: the ratchet rolls
/// back its in-memory change and surfaces `RatchetError::Persistence`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A record that must exist is missing
    #[error("no record under {key}")]
    NotFound {
        /// Missing key
        key: String,
    },

    /// The record was written in another format version
    #[error("record {key} has version {found}, expected {expected}")]
    VersionMismatch {
        /// Record key
        key: String,
        /// Version the caller reads
        expected: u64,
        /// Version on disk
        found: u64,
    },

    /// CBOR encoding or decoding failed
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The backend failed
    #[error("storage backend failed: {0}")]
    Io(String),
}

