//! Standard ratchet invariants.

use std::collections::{BTreeSet, HashMap};

use ratchetmix_core::{Direction, MAX_UNCONFIRMED};

use super::{Invariant, InvariantResult, StoreSnapshot, Violation};

/// Every key index is either used or unused, never both, never neither.
pub struct KeyPartition;

impl Invariant for KeyPartition {
    fn name(&self) -> &'static str {
        "key_partition"
    }

    fn check(&self, state: &StoreSnapshot) -> InvariantResult {
        for session in &state.sessions {
            let used: BTreeSet<u32> = session.used.iter().copied().collect();
            let unused: BTreeSet<u32> = session.unused.iter().copied().collect();

            if let Some(both) = used.intersection(&unused).next() {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("session {}: index {both} is both used and unused", session.id),
                });
            }

            let covered = used.len() + unused.len();
            let in_range = used.iter().chain(&unused).all(|&i| i < session.num_keys);
            if covered != session.num_keys as usize || !in_range {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "session {}: {} used + {} unused does not partition {} keys",
                        session.id,
                        used.len(),
                        unused.len(),
                        session.num_keys
                    ),
                });
            }
        }
        Ok(())
    }
}

/// The fingerprint registry holds exactly the unused Receive keys.
pub struct FingerprintConsistency;

impl Invariant for FingerprintConsistency {
    fn name(&self) -> &'static str {
        "fingerprint_consistency"
    }

    fn check(&self, state: &StoreSnapshot) -> InvariantResult {
        let mut expected = 0usize;
        for session in state.sessions.iter().filter(|s| s.direction == Direction::Receive) {
            for fingerprint in &session.unused_fingerprints {
                if !state.registered.contains(fingerprint) {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "session {}: unused key {fingerprint:?} is not registered",
                            session.id
                        ),
                    });
                }
            }
            expected += session.unused_fingerprints.len();
        }

        if state.registered.len() != expected {
            return Err(Violation {
                invariant: self.name(),
                message: format!(
                    "{} fingerprints registered, {expected} unused receive keys",
                    state.registered.len()
                ),
            });
        }
        Ok(())
    }
}

/// No relationship keeps more than `MAX_UNCONFIRMED` confirmed sessions.
pub struct ConfirmedRetention;

impl Invariant for ConfirmedRetention {
    fn name(&self) -> &'static str {
        "confirmed_retention"
    }

    fn check(&self, state: &StoreSnapshot) -> InvariantResult {
        let mut confirmed = HashMap::new();
        for session in state.sessions.iter().filter(|s| s.negotiation.is_confirmed()) {
            *confirmed.entry((session.partner, session.direction)).or_insert(0usize) += 1;
        }

        for ((partner, direction), count) in confirmed {
            if count > MAX_UNCONFIRMED {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "partner {partner} {direction}: {count} confirmed sessions retained"
                    ),
                });
            }
        }
        Ok(())
    }
}
