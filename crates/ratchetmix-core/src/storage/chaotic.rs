//! Fault-injecting storage wrapper.
//!
//! Fails reads, writes and deletes at a configurable rate so tests can check
//! that a failed write surfaces as a fatal error and never leaves memory
//! ahead of disk. Failures are drawn from a seeded generator and replay
//! exactly for the same seed and call sequence.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]
#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::sync::{Arc, Mutex};

use super::{Storage, StorageError, StoredObject};

const DEFAULT_SEED: u64 = 0x5EED_CA05_0000_0001;

/// Storage operation subject to fault injection.
#[derive(Debug, Clone, Copy)]
enum Operation {
    Read,
    Write,
    Delete,
}

impl Operation {
    fn verb(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
        }
    }
}

/// Shared fault state. One lock keeps rate, draw and counters consistent.
struct Chaos {
    failure_rate: f64,
    /// splitmix64 state
    state: u64,
    operations: usize,
    injected: usize,
}

impl Chaos {
    fn draw(&mut self) -> f64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        (z >> 11) as f64 / (1u64 << 53) as f64
    }

    fn should_fail(&mut self) -> bool {
        self.operations += 1;
        // Always draw so a rate change does not shift later outcomes.
        let fail = self.draw() < self.failure_rate;
        if fail {
            self.injected += 1;
        }
        fail
    }
}

fn check_rate(failure_rate: f64) {
    assert!(
        (0.0..=1.0).contains(&failure_rate),
        "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
    );
}

/// Storage wrapper that fails a seeded fraction of operations.
///
/// Clones share the same fault state, so a store and the test holding the
/// wrapper see one sequence of outcomes.
#[derive(Clone)]
pub struct ChaoticStorage<S: Storage> {
    inner: S,
    chaos: Arc<Mutex<Chaos>>,
}

impl<S: Storage> ChaoticStorage<S> {
    /// Wrap `inner`, failing operations with probability `failure_rate`.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, DEFAULT_SEED)
    }

    /// Like [`ChaoticStorage::new`] with an explicit seed.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        check_rate(failure_rate);
        let chaos = Chaos { failure_rate, state: seed, operations: 0, injected: 0 };
        Self { inner, chaos: Arc::new(Mutex::new(chaos)) }
    }

    /// The wrapped storage, bypassing fault injection.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Change the failure rate for every clone.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn set_failure_rate(&self, failure_rate: f64) {
        check_rate(failure_rate);
        self.chaos.lock().expect("chaos mutex poisoned").failure_rate = failure_rate;
    }

    /// Operations attempted through this wrapper.
    pub fn operation_count(&self) -> usize {
        self.chaos.lock().expect("chaos mutex poisoned").operations
    }

    /// Operations failed by injection.
    pub fn injected_failures(&self) -> usize {
        self.chaos.lock().expect("chaos mutex poisoned").injected
    }

    fn gate(&self, operation: Operation, key: &str) -> Result<(), StorageError> {
        if self.chaos.lock().expect("chaos mutex poisoned").should_fail() {
            return Err(StorageError::Io(format!("injected {} failure for {key}", operation.verb())));
        }
        Ok(())
    }
}

impl<S: Storage> Storage for ChaoticStorage<S> {
    fn get(&self, key: &str, version: u64) -> Result<Option<StoredObject>, StorageError> {
        self.gate(Operation::Read, key)?;
        self.inner.get(key, version)
    }

    fn set(&self, key: &str, version: u64, data: &[u8]) -> Result<(), StorageError> {
        self.gate(Operation::Write, key)?;
        self.inner.set(key, version, data)
    }

    fn delete(&self, key: &str, version: u64) -> Result<(), StorageError> {
        self.gate(Operation::Delete, key)?;
        self.inner.delete(key, version)
    }
}
