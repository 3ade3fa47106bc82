//! Ratchetmix ratchet core.
//!
//! Per-partner pools of single-use symmetric keys, the logic that decides
//! when to negotiate a replacement pool, and the persistence that keeps key
//! usage crash-consistent.
//!
//! # Architecture
//!
//! ```text
//! Store ─┬─ Fingerprints (fingerprint → unused receive Key)
//!        └─ Manager (per partner)
//!             ├─ Relationship (Send)    ─ Session, Session, ... (newest first)
//!             └─ Relationship (Receive) ─ Session, Session, ...
//!                                           └─ StateVector (used key bits)
//! ```
//!
//! The crate performs no network I/O. The key-exchange protocol that carries
//! rekey triggers and confirms lives in `ratchetmix-client`. Time and
//! randomness come from an [`Environment`] so simulations are reproducible.
//!
//! # Invariants
//!
//! - A key index is on disk as used before it is handed out, and is never
//!   handed out twice
//! - Every unused key of every Receive session is in the fingerprint
//!   registry; consumed and deleted keys are not
//! - Persistence failures are surfaced as [`RatchetError::Persistence`] and
//!   are fatal to the caller

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod env;
pub mod error;
pub mod fingerprints;
pub mod key;
pub mod manager;
pub mod params;
pub mod relationship;
pub mod session;
pub mod state_vector;
pub mod storage;
pub mod store;

#[cfg(test)]
mod test_env;

pub use env::Environment;
pub use error::RatchetError;
pub use fingerprints::Fingerprints;
pub use key::Key;
pub use manager::Manager;
pub use params::{MAX_POOL_KEYS, SessionParams};
pub use relationship::{MAX_UNCONFIRMED, Relationship};
pub use session::{Direction, NegotiationStatus, Session, SessionSeed, SessionStatus};
pub use state_vector::{KeyBitSet, StateVector};
pub use storage::{ChaoticStorage, MemoryStorage, RedbStorage, Storage, StorageError};
pub use store::Store;
