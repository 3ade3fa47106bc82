//! All sessions for one (partner, direction) pair.
//!
//! Sessions are kept newest-first. Structural edits (add, confirm, clean)
//! take the write lock on the list. Key selection for sending additionally
//! holds `send_mux` for its whole duration so two senders cannot pick and pop
//! the same session inconsistently.

#![allow(clippy::disallowed_types, reason = "Synchronous locking operations only")]
#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use ratchetmix_proto::{PartnerId, SessionId};
use serde::{Deserialize, Serialize};

use crate::{
    env::Environment,
    error::RatchetError,
    fingerprints::Fingerprints,
    key::Key,
    session::{Direction, Session, SessionSeed, SessionStatus},
    storage::{Storage, load_cbor, save_cbor},
};

/// Confirmed sessions retained per relationship. Older confirmed sessions are
/// deleted by [`Relationship::clean`].
pub const MAX_UNCONFIRMED: usize = 3;

const RELATIONSHIP_VERSION: u64 = 0;

#[derive(Serialize, Deserialize)]
struct StoredRelationship {
    fingerprint: [u8; 32],
    /// Newest first
    sessions: Vec<SessionId>,
}

struct SessionList<S: Storage> {
    ordered: Vec<Arc<Session<S>>>,
    by_id: HashMap<SessionId, Arc<Session<S>>>,
}

impl<S: Storage> SessionList<S> {
    fn new() -> Self {
        Self { ordered: Vec::new(), by_id: HashMap::new() }
    }

    fn push_front(&mut self, session: Arc<Session<S>>) {
        self.by_id.insert(session.id(), Arc::clone(&session));
        self.ordered.insert(0, session);
    }

    fn remove(&mut self, id: &SessionId) {
        self.by_id.remove(id);
        self.ordered.retain(|s| s.id() != *id);
    }

    fn ids(&self) -> Vec<SessionId> {
        self.ordered.iter().map(|s| s.id()).collect()
    }
}

/// Session history for one partner in one direction.
pub struct Relationship<S: Storage> {
    partner: PartnerId,
    direction: Direction,
    fingerprint: [u8; 32],
    sessions: RwLock<SessionList<S>>,
    send_mux: Mutex<()>,
    fingerprints: Arc<Fingerprints<S>>,
    storage: S,
}

impl<S: Storage> Relationship<S> {
    /// Create an empty relationship and persist it.
    pub fn new(
        storage: S,
        partner: PartnerId,
        direction: Direction,
        fingerprint: [u8; 32],
        fingerprints: Arc<Fingerprints<S>>,
    ) -> Result<Self, RatchetError> {
        let relationship = Self {
            partner,
            direction,
            fingerprint,
            sessions: RwLock::new(SessionList::new()),
            send_mux: Mutex::new(()),
            fingerprints,
            storage,
        };
        relationship.save(&[])?;
        Ok(relationship)
    }

    /// Load a persisted relationship and every session in it.
    pub fn load(
        storage: S,
        partner: PartnerId,
        direction: Direction,
        fingerprints: Arc<Fingerprints<S>>,
    ) -> Result<Self, RatchetError> {
        let key = Self::storage_key(&partner, direction);
        let stored: StoredRelationship = load_cbor(&storage, &key, RELATIONSHIP_VERSION)
            .map_err(|e| RatchetError::persistence(key, e))?;

        let mut list = SessionList::new();
        for id in stored.sessions.iter().rev() {
            let session = Session::load(storage.clone(), *id, &fingerprints)?;
            list.push_front(session);
        }

        tracing::debug!(%partner, %direction, sessions = list.ordered.len(), "relationship loaded");

        Ok(Self {
            partner,
            direction,
            fingerprint: stored.fingerprint,
            sessions: RwLock::new(list),
            send_mux: Mutex::new(()),
            fingerprints,
            storage,
        })
    }

    /// Storage key for the relationship with `partner` in `direction`.
    pub fn storage_key(partner: &PartnerId, direction: Direction) -> String {
        format!("partner/{}/{}/relationship", partner.to_hex(), direction.as_str())
    }

    /// Partner this relationship is with.
    pub fn partner(&self) -> PartnerId {
        self.partner
    }

    /// Direction of every session in this relationship.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Relationship fingerprint. Equal to the partner's mirrored relationship.
    pub fn fingerprint(&self) -> [u8; 32] {
        self.fingerprint
    }

    /// Number of sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().expect("relationship lock poisoned").ordered.len()
    }

    /// Returns `true` if the relationship has no sessions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the sessions, newest first.
    pub fn sessions(&self) -> Vec<Arc<Session<S>>> {
        self.sessions.read().expect("relationship lock poisoned").ordered.clone()
    }

    /// Session by ID.
    pub fn get(&self, id: &SessionId) -> Option<Arc<Session<S>>> {
        self.sessions.read().expect("relationship lock poisoned").by_id.get(id).cloned()
    }

    /// Generate a session from `seed` and insert it as the newest.
    ///
    /// If the seed determines an ID that is already present, the existing
    /// session is returned untouched and the flag is `true`.
    /// A confirmed insert runs [`Self::clean`].
    ///
    /// # Errors
    ///
    /// - `InvalidParams` if the seed's parameters are unusable
    /// - `Persistence` if a write fails. The new session is removed again.
    pub fn add_session<E: Environment>(
        &self,
        mut seed: SessionSeed,
        env: &E,
    ) -> Result<(Arc<Session<S>>, bool), RatchetError> {
        seed.direction = self.direction;
        seed.partner = self.partner;
        seed.relationship = self.fingerprint;

        let session = {
            let mut list = self.sessions.write().expect("relationship lock poisoned");

            if let Some(existing) = seed.session_id().and_then(|id| list.by_id.get(&id).cloned()) {
                tracing::debug!(
                    partner = %self.partner,
                    session = %existing.id(),
                    "session already present"
                );
                return Ok((existing, true));
            }

            let session =
                Session::generate(seed, self.storage.clone(), env, &self.fingerprints)?;
            list.push_front(Arc::clone(&session));

            if let Err(e) = self.save(&list.ids()) {
                list.remove(&session.id());
                if let Err(cleanup) = session.delete(&self.fingerprints) {
                    tracing::error!(session = %session.id(), error = %cleanup, "rollback cleanup failed");
                }
                return Err(e);
            }
            session
        };

        if session.is_confirmed() {
            self.clean()?;
        }

        Ok((session, false))
    }

    /// Pick the session ordinary messages should be sent on.
    ///
    /// Priority, first non-empty bucket wins, newest first within a bucket:
    /// 1. Active and confirmed
    /// 2. RekeyNeeded and confirmed
    /// 3. Active and unconfirmed
    /// 4. RekeyNeeded and unconfirmed
    pub fn session_for_sending(&self) -> Option<Arc<Session<S>>> {
        let list = self.sessions.read().expect("relationship lock poisoned");

        let mut rekey_confirmed = None;
        let mut active_unconfirmed = None;
        let mut rekey_unconfirmed = None;

        for session in &list.ordered {
            match (session.status(), session.is_confirmed()) {
                (SessionStatus::Active, true) => return Some(Arc::clone(session)),
                (SessionStatus::RekeyNeeded, true) => {
                    rekey_confirmed.get_or_insert_with(|| Arc::clone(session));
                },
                (SessionStatus::Active, false) => {
                    active_unconfirmed.get_or_insert_with(|| Arc::clone(session));
                },
                (SessionStatus::RekeyNeeded, false) => {
                    rekey_unconfirmed.get_or_insert_with(|| Arc::clone(session));
                },
                _ => {},
            }
        }

        rekey_confirmed.or(active_unconfirmed).or(rekey_unconfirmed)
    }

    /// Newest session that still has any key, preferring confirmed ones.
    pub fn newest_rekeyable_session(&self) -> Option<Arc<Session<S>>> {
        let list = self.sessions.read().expect("relationship lock poisoned");

        let mut unconfirmed = None;
        for session in &list.ordered {
            if session.status() == SessionStatus::RekeyEmpty {
                continue;
            }
            if session.is_confirmed() {
                return Some(Arc::clone(session));
            }
            unconfirmed.get_or_insert_with(|| Arc::clone(session));
        }
        unconfirmed
    }

    /// Key for an ordinary message.
    ///
    /// # Errors
    ///
    /// - `NoSendableSession` if every session is exhausted or reserved
    /// - `Persistence` if reserving the key fails
    pub fn key_for_sending(&self) -> Result<Key<S>, RatchetError> {
        let _guard = self.send_mux.lock().expect("send mutex poisoned");

        let session =
            self.session_for_sending().ok_or(RatchetError::NoSendableSession(self.partner))?;
        session.pop_key()
    }

    /// Key for a key-exchange message, allowed to use the rekey reserve.
    ///
    /// # Errors
    ///
    /// - `NoSendableSession` if every session is fully exhausted
    /// - `Persistence` if reserving the key fails
    pub fn key_for_rekey(&self) -> Result<Key<S>, RatchetError> {
        let _guard = self.send_mux.lock().expect("send mutex poisoned");

        let session = self
            .newest_rekeyable_session()
            .ok_or(RatchetError::NoSendableSession(self.partner))?;
        session.pop_rekey()
    }

    /// Sessions that need negotiation work this cycle.
    ///
    /// Each returned session has already moved to `Sending` or
    /// `NewSessionTriggered`.
    pub fn trigger_negotiation<E: Environment>(&self, env: &E) -> Vec<Arc<Session<S>>> {
        self.sessions().into_iter().filter(|session| session.trigger_negotiation(env)).collect()
    }

    /// Mark session `id` acknowledged, then drop old confirmed sessions.
    ///
    /// # Errors
    ///
    /// - `UnknownSession` if `id` is not in this relationship
    /// - `Persistence` if a write fails
    pub fn confirm(&self, id: &SessionId) -> Result<(), RatchetError> {
        let session = self.get(id).ok_or(RatchetError::UnknownSession(*id))?;
        session.confirm()?;

        tracing::info!(partner = %self.partner, session = %id, direction = %self.direction, "session confirmed");

        self.clean()
    }

    /// Delete confirmed sessions beyond the newest [`MAX_UNCONFIRMED`].
    ///
    /// Unconfirmed sessions are never deleted.
    pub fn clean(&self) -> Result<(), RatchetError> {
        let mut list = self.sessions.write().expect("relationship lock poisoned");

        let mut confirmed = 0;
        let mut stale = Vec::new();
        for session in &list.ordered {
            if !session.is_confirmed() {
                continue;
            }
            confirmed += 1;
            if confirmed > MAX_UNCONFIRMED {
                stale.push(Arc::clone(session));
            }
        }

        if stale.is_empty() {
            return Ok(());
        }

        let remaining: Vec<SessionId> = list
            .ordered
            .iter()
            .filter(|s| !stale.iter().any(|old| old.id() == s.id()))
            .map(|s| s.id())
            .collect();
        self.save(&remaining)?;

        for session in stale {
            list.remove(&session.id());
            session.delete(&self.fingerprints)?;
            tracing::info!(partner = %self.partner, session = %session.id(), "old session cleaned");
        }

        Ok(())
    }

    /// Delete every session and the relationship record.
    pub fn delete(&self) -> Result<(), RatchetError> {
        let mut list = self.sessions.write().expect("relationship lock poisoned");

        for session in &list.ordered {
            session.delete(&self.fingerprints)?;
        }
        *list = SessionList::new();

        let key = Self::storage_key(&self.partner, self.direction);
        self.storage
            .delete(&key, RELATIONSHIP_VERSION)
            .map_err(|e| RatchetError::persistence(key, e))
    }

    fn save(&self, ids: &[SessionId]) -> Result<(), RatchetError> {
        let stored = StoredRelationship { fingerprint: self.fingerprint, sessions: ids.to_vec() };
        let key = Self::storage_key(&self.partner, self.direction);
        save_cbor(&self.storage, &key, RELATIONSHIP_VERSION, &stored).map_err(|e| {
            tracing::error!(partner = %self.partner, error = %e, "relationship write failed");
            RatchetError::persistence(key, e)
        })
    }
}

impl<S: Storage> std::fmt::Debug for Relationship<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relationship")
            .field("partner", &self.partner)
            .field("direction", &self.direction)
            .field("sessions", &self.len())
            .finish_non_exhaustive()
    }
}
