//! Invariant checking for simulations.
//!
//! Invariants are properties of ratchet state that hold at every quiescent
//! point, whatever messages were lost or reordered on the way there. A
//! [`StoreSnapshot`] captures one client's store; registered [`Invariant`]s
//! are checked against it.
//!
//! ```ignore
//! let registry = InvariantRegistry::standard();
//! registry.assert_all(&StoreSnapshot::capture(&store), "after rekey");
//! ```

mod checks;
mod snapshot;

pub use checks::{ConfirmedRetention, FingerprintConsistency, KeyPartition};
pub use snapshot::{SessionSnapshot, StoreSnapshot};

/// Invariant check result.
pub type InvariantResult = Result<(), Violation>;

/// Invariant violation with context.
#[derive(Debug, Clone)]
pub struct Violation {
    /// Name of the violated invariant.
    pub invariant: &'static str,
    /// Description of what went wrong.
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.invariant, self.message)
    }
}

impl std::error::Error for Violation {}

/// A property checked against a store snapshot.
pub trait Invariant: Send + Sync {
    /// Invariant name for error reporting.
    fn name(&self) -> &'static str;

    /// Check the invariant against `state`.
    fn check(&self, state: &StoreSnapshot) -> InvariantResult;
}

/// Set of invariants checked together.
pub struct InvariantRegistry {
    invariants: Vec<Box<dyn Invariant>>,
}

impl Default for InvariantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InvariantRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self { invariants: Vec::new() }
    }

    /// Registry with the standard ratchet invariants:
    /// - [`KeyPartition`]: used and unused indices partition each pool
    /// - [`FingerprintConsistency`]: the registry matches unused receive keys
    /// - [`ConfirmedRetention`]: cleanup bounds confirmed sessions
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.add(KeyPartition);
        registry.add(FingerprintConsistency);
        registry.add(ConfirmedRetention);
        registry
    }

    /// Add an invariant.
    pub fn add<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Check every invariant, collecting all violations.
    pub fn check_all(&self, state: &StoreSnapshot) -> Result<(), Vec<Violation>> {
        let violations: Vec<_> =
            self.invariants.iter().filter_map(|inv| inv.check(state).err()).collect();

        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }

    /// Check every invariant, panicking with all violations on failure.
    #[allow(clippy::panic, reason = "Simulation assertions fail the test")]
    pub fn assert_all(&self, state: &StoreSnapshot, context: &str) {
        if let Err(violations) = self.check_all(state) {
            let messages: Vec<_> = violations.iter().map(ToString::to_string).collect();
            panic!("invariant violation {context}:\n  {}", messages.join("\n  "));
        }
    }

    /// Number of registered invariants.
    pub fn len(&self) -> usize {
        self.invariants.len()
    }

    /// True if no invariant is registered.
    pub fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }
}

impl std::fmt::Debug for InvariantRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.invariants.iter().map(|inv| inv.name())).finish()
    }
}

#[cfg(test)]
mod tests {
    use ratchetmix_core::{Direction, NegotiationStatus};
    use ratchetmix_crypto::Fingerprint;
    use ratchetmix_proto::{PartnerId, SessionId};

    use super::*;

    fn session(direction: Direction, used: Vec<u32>, unused: Vec<u32>) -> SessionSnapshot {
        let unused_fingerprints =
            unused.iter().map(|&i| Fingerprint::from_bytes([i as u8; 32])).collect();
        SessionSnapshot {
            partner: PartnerId::from_bytes([1; 32]),
            direction,
            id: SessionId::from_bytes([2; 32]),
            num_keys: 4,
            used,
            unused,
            unused_fingerprints,
            negotiation: NegotiationStatus::Confirmed,
        }
    }

    #[test]
    fn standard_registry_has_invariants() {
        let registry = InvariantRegistry::standard();
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn empty_snapshot_passes() {
        assert!(InvariantRegistry::standard().check_all(&StoreSnapshot::empty()).is_ok());
    }

    #[test]
    fn overlapping_indices_violate_partition() {
        let state = StoreSnapshot {
            sessions: vec![session(Direction::Send, vec![0, 1], vec![1, 2, 3])],
            ..StoreSnapshot::empty()
        };

        let violation = KeyPartition.check(&state).unwrap_err();
        assert_eq!(violation.invariant, "key_partition");
    }

    #[test]
    fn missing_index_violates_partition() {
        let state = StoreSnapshot {
            sessions: vec![session(Direction::Send, vec![0], vec![2, 3])],
            ..StoreSnapshot::empty()
        };

        assert!(KeyPartition.check(&state).is_err());
    }

    #[test]
    fn unregistered_receive_key_is_detected() {
        let mut state = StoreSnapshot {
            sessions: vec![session(Direction::Receive, vec![0], vec![1, 2, 3])],
            ..StoreSnapshot::empty()
        };
        state.registered = [1u8, 2].iter().map(|&i| Fingerprint::from_bytes([i; 32])).collect();

        assert!(FingerprintConsistency.check(&state).is_err());

        state.registered.insert(Fingerprint::from_bytes([3; 32]));
        assert!(FingerprintConsistency.check(&state).is_ok());
    }

    #[test]
    fn stray_registration_is_detected() {
        let mut state = StoreSnapshot {
            sessions: vec![session(Direction::Send, vec![0], vec![1, 2, 3])],
            ..StoreSnapshot::empty()
        };
        state.registered.insert(Fingerprint::from_bytes([1; 32]));

        assert!(FingerprintConsistency.check(&state).is_err());
    }

    #[test]
    fn too_many_confirmed_sessions_violate_retention() {
        let mut sessions = Vec::new();
        for i in 0..4u8 {
            let mut s = session(Direction::Send, vec![0, 1, 2, 3], vec![]);
            s.id = SessionId::from_bytes([i; 32]);
            sessions.push(s);
        }
        let state = StoreSnapshot { sessions, ..StoreSnapshot::empty() };

        assert!(ConfirmedRetention.check(&state).is_err());
    }
}
