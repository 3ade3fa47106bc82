//! Observable ratchet state, captured for invariant checking.

use std::collections::HashSet;

use ratchetmix_core::{Direction, Environment, NegotiationStatus, Storage, Store};
use ratchetmix_crypto::Fingerprint;
use ratchetmix_proto::{PartnerId, SessionId};

/// Snapshot of one client's store.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    /// The client's own identity
    pub owner: Option<PartnerId>,
    /// Every session of every relationship, newest first per relationship
    pub sessions: Vec<SessionSnapshot>,
    /// Fingerprints registered for incoming messages
    pub registered: HashSet<Fingerprint>,
}

/// Snapshot of one session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// Partner the session belongs to
    pub partner: PartnerId,
    /// Relationship direction
    pub direction: Direction,
    /// Session identifier
    pub id: SessionId,
    /// Pool size
    pub num_keys: u32,
    /// Indices marked used
    pub used: Vec<u32>,
    /// Indices still available
    pub unused: Vec<u32>,
    /// Fingerprints of the unused keys
    pub unused_fingerprints: Vec<Fingerprint>,
    /// Negotiation status
    pub negotiation: NegotiationStatus,
}

impl StoreSnapshot {
    /// Snapshot with no sessions.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Capture the current state of `store`.
    ///
    /// Not atomic across sessions: take snapshots at quiescent points.
    pub fn capture<S: Storage, E: Environment>(store: &Store<S, E>) -> Self {
        let mut sessions = Vec::new();
        for manager in store.managers() {
            for relationship in [manager.send_relationship(), manager.receive_relationship()] {
                for session in relationship.sessions() {
                    let unused_fingerprints =
                        session.unused_keys().iter().map(|key| key.fingerprint()).collect();
                    sessions.push(SessionSnapshot {
                        partner: session.partner(),
                        direction: session.direction(),
                        id: session.id(),
                        num_keys: session.num_keys(),
                        used: session.used_key_nums(),
                        unused: session.unused_key_nums(),
                        unused_fingerprints,
                        negotiation: session.negotiation_status(),
                    });
                }
            }
        }

        Self {
            owner: Some(store.my_id()),
            sessions,
            registered: store.fingerprints().fingerprints().into_iter().collect(),
        }
    }

    /// Sessions of one relationship.
    pub fn relationship(
        &self,
        partner: PartnerId,
        direction: Direction,
    ) -> impl Iterator<Item = &SessionSnapshot> {
        self.sessions.iter().filter(move |s| s.partner == partner && s.direction == direction)
    }
}
