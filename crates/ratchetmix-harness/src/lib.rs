//! Deterministic simulation harness for ratchetmix.
//!
//! Seeded implementations of the client's collaborators, for reproducible
//! tests of the ratchet and key exchange under message loss and crashes:
//! - [`SimEnv`]: seeded randomness over tokio's clock
//! - [`LoopbackNetwork`]: in-process network with drop and refusal faults
//! - [`RecordingCritical`] and [`ReinjectingGarbled`]: message buffers
//! - [`SimPair`]: two partners wired together, each with its own driver
//!
//! # Invariant Testing
//!
//! The `invariants` module checks what must hold in any client's store at a
//! quiescent point. Use [`InvariantRegistry::standard()`] for the ratchet's
//! key-accounting invariants.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod buffers;
pub mod invariants;
pub mod network;
pub mod pair;
pub mod sim_env;

pub use buffers::{RecordingCritical, ReinjectingGarbled};
pub use invariants::{
    ConfirmedRetention, FingerprintConsistency, Invariant, InvariantRegistry, InvariantResult,
    KeyPartition, SessionSnapshot, StoreSnapshot, Violation,
};
pub use network::{Endpoint, INBOX_CAPACITY, LoopbackNetwork, NetworkStats, SimTransport};
pub use pair::{SimClient, SimPair};
pub use sim_env::SimEnv;
