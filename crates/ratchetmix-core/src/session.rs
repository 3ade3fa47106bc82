//! One ratchet step: a DH-keyed pool of single-use keys for one direction
//! with one partner.
//!
//! # Lifecycle
//!
//! ```text
//!            generate()                     pop_key / pop_rekey
//!  (my priv, partner pub) ──► Session ─────────────────────────► Keys
//!                               │
//!                               │ negotiation (send side)
//!                               ▼
//!  Unconfirmed ─► Sending ─► Sent ─► Confirmed ─► NewSessionTriggered
//!       ▲            │                                   │
//!       └────────────┘ (send failed)                     ▼
//!                                                NewSessionCreated
//! ```
//!
//! # Invariants
//!
//! - The base key is derived once at generation and never changes
//! - Pool size and ttl are fixed at generation from base key entropy
//! - `num_keys - ttl >= num_rekeys`, so the rekey window always covers the
//!   rekey reserve
//! - Every unused key of a Receive session is in the fingerprint registry.
//!   Send session keys never are.

#![allow(clippy::disallowed_types, reason = "Synchronous locking operations only")]
#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{fmt, sync::Arc, sync::Mutex};

use ratchetmix_crypto::{
    BaseKey, PrivateKey, PublicKey, derive_key_fingerprint, generate_key_ttl, session_base_key,
    session_id,
};
use ratchetmix_proto::{PartnerId, SessionId};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{
    env::Environment,
    error::RatchetError,
    fingerprints::Fingerprints,
    key::Key,
    params::SessionParams,
    state_vector::StateVector,
    storage::{Storage, StorageError, load_cbor, save_cbor},
};

/// Storage format version for sessions.
const SESSION_VERSION: u64 = 0;

/// Direction of a session relative to this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Keys encrypt messages to the partner
    Send,
    /// Keys decrypt messages from the partner
    Receive,
}

impl Direction {
    /// Lowercase name used in storage keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Receive => "receive",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol state of a session with respect to being announced to and
/// acknowledged by the partner.
///
/// Ordered: every status from `Confirmed` on means the partner has the
/// session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NegotiationStatus {
    /// Not yet acknowledged and no announcement in flight
    Unconfirmed,
    /// Announcement being sent
    Sending,
    /// Announcement delivered, waiting for the confirm
    Sent,
    /// Partner acknowledged the session
    Confirmed,
    /// Session needs a successor and one is about to be created
    NewSessionTriggered,
    /// Successor has been created
    NewSessionCreated,
}

impl NegotiationStatus {
    /// Whether the partner is known to have this session.
    pub fn is_confirmed(self) -> bool {
        self >= Self::Confirmed
    }

    /// Whether moving from `self` to `to` is allowed.
    pub fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Unconfirmed, Self::Sending | Self::Confirmed)
                | (Self::Sending, Self::Unconfirmed | Self::Sent | Self::Confirmed)
                | (Self::Sent, Self::Confirmed | Self::Unconfirmed)
                | (Self::Confirmed, Self::NewSessionTriggered)
                | (Self::NewSessionTriggered, Self::Confirmed | Self::NewSessionCreated)
        )
    }

    /// Status written to disk.
    ///
    /// In-flight states are stored as the state they fall back to, so a
    /// crash mid-negotiation restarts the negotiation instead of stranding
    /// it.
    pub fn persisted(self) -> Self {
        match self {
            Self::Sending => Self::Unconfirmed,
            Self::NewSessionTriggered => Self::Confirmed,
            other => other,
        }
    }
}

/// Health of a session's key pool, derived from its remaining key count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    /// Ample keys remain
    Active,
    /// Keys are below the ttl threshold but ordinary keys remain
    RekeyNeeded,
    /// Only rekey-reserved keys remain
    Empty,
    /// No keys remain at all
    RekeyEmpty,
}

/// Inputs for generating a session.
#[derive(Debug, Clone)]
pub struct SessionSeed {
    /// Direction of the new session
    pub direction: Direction,
    /// Partner the session is with
    pub partner: PartnerId,
    /// Own private key. Generated when `None`.
    pub my_private: Option<PrivateKey>,
    /// Partner's public key
    pub partner_public: PublicKey,
    /// Fingerprint of the owning relationship, salting the base key
    pub relationship: [u8; 32],
    /// Base key to use instead of deriving one
    pub base_key: Option<BaseKey>,
    /// Session this one was derived from
    pub trigger: SessionId,
    /// Initial negotiation status
    pub negotiation: NegotiationStatus,
    /// Pool sizing
    pub params: SessionParams,
}

impl SessionSeed {
    /// ID the generated session will have, if it is already determined.
    ///
    /// `None` when the private key is still to be generated.
    pub fn session_id(&self) -> Option<SessionId> {
        let base_key = match (&self.base_key, &self.my_private) {
            (Some(base_key), _) => base_key.clone(),
            (None, Some(my_private)) => {
                session_base_key(my_private, &self.partner_public, &self.relationship)
            },
            (None, None) => return None,
        };
        Some(SessionId::from_bytes(session_id(&base_key)))
    }
}

/// Persisted form of a [`Session`].
#[derive(Serialize, Deserialize)]
struct StoredSession {
    direction: Direction,
    partner: PartnerId,
    my_private: [u8; 32],
    partner_public: [u8; 32],
    relationship: [u8; 32],
    base_key: [u8; 32],
    params: SessionParams,
    ttl: u32,
    trigger: SessionId,
    negotiation: NegotiationStatus,
}

/// One DH-keyed pool of single-use keys.
///
/// Shared through `Arc`: the owning relationship holds one reference and
/// every outstanding [`Key`] holds another.
pub struct Session<S: Storage> {
    id: SessionId,
    direction: Direction,
    partner: PartnerId,
    my_private: PrivateKey,
    partner_public: PublicKey,
    relationship: [u8; 32],
    base_key: BaseKey,
    params: SessionParams,
    ttl: u32,
    trigger: SessionId,
    negotiation: Mutex<NegotiationStatus>,
    state_vector: StateVector<S>,
    storage: S,
}

impl<S: Storage> Session<S> {
    /// Create a new session and persist it.
    ///
    /// Generates a private key when none is supplied, derives the base key
    /// (unless overridden), sizes the pool from base key entropy, and for
    /// Receive sessions registers every key in `fingerprints`.
    pub fn generate<E: Environment>(
        seed: SessionSeed,
        storage: S,
        env: &E,
        fingerprints: &Fingerprints<S>,
    ) -> Result<Arc<Self>, RatchetError> {
        seed.params.validate()?;

        let my_private = seed.my_private.unwrap_or_else(|| {
            let mut bytes = Zeroizing::new([0u8; 32]);
            env.random_bytes(bytes.as_mut_slice());
            PrivateKey::from_random_bytes(*bytes)
        });
        let base_key = seed.base_key.unwrap_or_else(|| {
            session_base_key(&my_private, &seed.partner_public, &seed.relationship)
        });

        let params = seed.params;
        let (ttl, mut num_keys) =
            generate_key_ttl(&base_key, params.min_keys, params.max_keys, params.ttl_params());
        if num_keys - ttl < params.num_rekeys {
            num_keys = ttl.checked_add(params.num_rekeys).ok_or_else(|| {
                RatchetError::InvalidParams(format!(
                    "ttl ({ttl}) plus num_rekeys ({}) overflows",
                    params.num_rekeys
                ))
            })?;
        }

        let id = SessionId::from_bytes(session_id(&base_key));
        let state_vector = StateVector::new(storage.clone(), id, num_keys)?;

        let session = Arc::new(Self {
            id,
            direction: seed.direction,
            partner: seed.partner,
            my_private,
            partner_public: seed.partner_public,
            relationship: seed.relationship,
            base_key,
            params,
            ttl,
            trigger: seed.trigger,
            negotiation: Mutex::new(seed.negotiation),
            state_vector,
            storage,
        });
        session.save(seed.negotiation)?;

        if session.direction == Direction::Receive {
            fingerprints.add(session.unused_keys());
        }

        tracing::info!(
            partner = %session.partner,
            session = %id,
            direction = %session.direction,
            num_keys,
            ttl,
            negotiation = ?seed.negotiation,
            "session generated"
        );

        Ok(session)
    }

    /// Load a persisted session, re-registering unused Receive keys.
    pub fn load(
        storage: S,
        id: SessionId,
        fingerprints: &Fingerprints<S>,
    ) -> Result<Arc<Self>, RatchetError> {
        let key = Self::storage_key(&id);
        let stored: StoredSession = load_cbor(&storage, &key, SESSION_VERSION)
            .map_err(|e| RatchetError::persistence(key.clone(), e))?;

        let base_key = BaseKey::from_bytes(stored.base_key);
        if session_id(&base_key) != *id.as_bytes() {
            return Err(RatchetError::persistence(
                key,
                StorageError::Serialization("session id does not match base key".to_string()),
            ));
        }

        let state_vector = StateVector::load(storage.clone(), id)?;
        let session = Arc::new(Self {
            id,
            direction: stored.direction,
            partner: stored.partner,
            my_private: PrivateKey::from_random_bytes(stored.my_private),
            partner_public: PublicKey::from_bytes(stored.partner_public),
            relationship: stored.relationship,
            base_key,
            params: stored.params,
            ttl: stored.ttl,
            trigger: stored.trigger,
            negotiation: Mutex::new(stored.negotiation),
            state_vector,
            storage,
        });

        if session.direction == Direction::Receive {
            fingerprints.add(session.unused_keys());
        }

        Ok(session)
    }

    /// Storage key for the session `id`.
    pub fn storage_key(id: &SessionId) -> String {
        format!("session/{}/state", id.to_hex())
    }

    /// Session identity (hash of the base key).
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Direction of this session.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Partner this session is with.
    pub fn partner(&self) -> PartnerId {
        self.partner
    }

    /// Own private key.
    pub fn my_private_key(&self) -> &PrivateKey {
        &self.my_private
    }

    /// Own public key, announced in rekey triggers.
    pub fn my_public_key(&self) -> PublicKey {
        self.my_private.public_key()
    }

    /// Partner's public key.
    pub fn partner_public_key(&self) -> PublicKey {
        self.partner_public
    }

    /// Fingerprint of the relationship this session belongs to.
    pub fn relationship_fingerprint(&self) -> [u8; 32] {
        self.relationship
    }

    /// Base key every pool key is derived from.
    pub fn base_key(&self) -> &BaseKey {
        &self.base_key
    }

    /// Session this one was derived from.
    pub fn trigger_session(&self) -> SessionId {
        self.trigger
    }

    /// Keys that may be used before a rekey is due.
    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    /// Parameters the pool was generated with.
    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    /// Size of the pool.
    pub fn num_keys(&self) -> u32 {
        self.state_vector.num_keys()
    }

    /// Keys not yet used.
    pub fn num_available(&self) -> u32 {
        self.state_vector.num_available()
    }

    /// Unused key indices, increasing.
    pub fn unused_key_nums(&self) -> Vec<u32> {
        self.state_vector.unused_key_nums()
    }

    /// Used key indices, increasing.
    pub fn used_key_nums(&self) -> Vec<u32> {
        self.state_vector.used_key_nums()
    }

    /// Current negotiation status.
    pub fn negotiation_status(&self) -> NegotiationStatus {
        *self.negotiation.lock().expect("negotiation mutex poisoned")
    }

    /// Whether the partner is known to have this session.
    pub fn is_confirmed(&self) -> bool {
        self.negotiation_status().is_confirmed()
    }

    /// Health of the key pool.
    pub fn status(&self) -> SessionStatus {
        let available = self.state_vector.num_available();
        let num_keys = self.state_vector.num_keys();

        if available == 0 {
            SessionStatus::RekeyEmpty
        } else if available <= self.params.num_rekeys {
            SessionStatus::Empty
        } else if available <= num_keys - self.ttl {
            SessionStatus::RekeyNeeded
        } else {
            SessionStatus::Active
        }
    }

    /// Take the next key for an ordinary message.
    ///
    /// # Errors
    ///
    /// - `ReservedForRekey` once only the rekey reserve remains
    /// - `KeysExhausted` when the pool is empty
    pub fn pop_key(self: &Arc<Self>) -> Result<Key<S>, RatchetError> {
        let index = self.state_vector.next_with_reserve(self.params.num_rekeys)?;
        tracing::debug!(session = %self.id, index, "popped key");
        Ok(Key::new(Arc::clone(self), index))
    }

    /// Take the next key for a key-exchange message, ignoring the reserve.
    ///
    /// # Errors
    ///
    /// - `KeysExhausted` when the pool is empty
    pub fn pop_rekey(self: &Arc<Self>) -> Result<Key<S>, RatchetError> {
        let index = self.state_vector.next()?;
        tracing::debug!(session = %self.id, index, "popped rekey key");
        Ok(Key::new(Arc::clone(self), index))
    }

    /// Handles for every unused key.
    pub fn unused_keys(self: &Arc<Self>) -> Vec<Key<S>> {
        self.state_vector
            .unused_key_nums()
            .into_iter()
            .map(|index| Key::new(Arc::clone(self), index))
            .collect()
    }

    /// Mark `index` used. Idempotent.
    pub fn use_key(&self, index: u32) -> Result<(), RatchetError> {
        self.state_vector.mark_used(index)
    }

    /// Move to negotiation status `to`.
    ///
    /// Writes only when the persisted form changes.
    ///
    /// # Errors
    ///
    /// - `IllegalTransition` if `to` is not reachable from the current status
    /// - `Persistence` if the write fails. The status is rolled back.
    pub fn set_negotiation_status(&self, to: NegotiationStatus) -> Result<(), RatchetError> {
        let mut current = self.negotiation.lock().expect("negotiation mutex poisoned");
        self.transition(&mut current, to)
    }

    /// Mark the session acknowledged by the partner.
    ///
    /// Idempotent: confirming a confirmed session succeeds without change.
    pub fn confirm(&self) -> Result<(), RatchetError> {
        let mut current = self.negotiation.lock().expect("negotiation mutex poisoned");
        if current.is_confirmed() {
            return Ok(());
        }
        self.transition(&mut current, NegotiationStatus::Confirmed)
    }

    /// Decide whether this session needs negotiation work this cycle.
    ///
    /// Returns true, after moving to the matching in-flight status, when:
    /// - the session is `Unconfirmed` and either needs a rekey (`RekeyNeeded`
    ///   or `Empty`) or wins the unconfirmed retry draw. It moves to
    ///   `Sending` and is re-announced.
    /// - the session is `Confirmed` and has used up its ttl with no successor
    ///   yet. It moves to `NewSessionTriggered` and a replacement is created.
    pub fn trigger_negotiation<E: Environment>(&self, env: &E) -> bool {
        let status = self.status();
        let mut current = self.negotiation.lock().expect("negotiation mutex poisoned");

        let next = match *current {
            NegotiationStatus::Unconfirmed => {
                let due = matches!(status, SessionStatus::RekeyNeeded | SessionStatus::Empty);
                let retry = status == SessionStatus::Active
                    && env.random_f64() < self.params.unconfirmed_retry_ratio;
                (due || retry).then_some(NegotiationStatus::Sending)
            },
            NegotiationStatus::Confirmed if status != SessionStatus::Active => {
                Some(NegotiationStatus::NewSessionTriggered)
            },
            _ => None,
        };

        let Some(next) = next else {
            return false;
        };

        match self.transition(&mut current, next) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(session = %self.id, error = %e, "negotiation trigger failed");
                false
            },
        }
    }

    /// Remove the session: unregister unused Receive keys and delete the
    /// persisted state.
    pub fn delete(&self, fingerprints: &Fingerprints<S>) -> Result<(), RatchetError> {
        if self.direction == Direction::Receive {
            fingerprints.remove(
                self.state_vector
                    .unused_key_nums()
                    .into_iter()
                    .map(|index| derive_key_fingerprint(&self.base_key, index)),
            );
        }

        self.state_vector.delete()?;

        let key = Self::storage_key(&self.id);
        self.storage.delete(&key, SESSION_VERSION).map_err(|e| RatchetError::persistence(key, e))?;

        tracing::info!(partner = %self.partner, session = %self.id, direction = %self.direction, "session deleted");
        Ok(())
    }

    fn transition(
        &self,
        current: &mut NegotiationStatus,
        to: NegotiationStatus,
    ) -> Result<(), RatchetError> {
        let from = *current;
        if !from.can_transition_to(to) {
            return Err(RatchetError::IllegalTransition { session: self.id, from, to });
        }

        if from.persisted() != to.persisted() {
            self.save(to)?;
        }
        *current = to;

        tracing::debug!(session = %self.id, ?from, ?to, "negotiation status changed");
        Ok(())
    }

    fn save(&self, negotiation: NegotiationStatus) -> Result<(), RatchetError> {
        let stored = StoredSession {
            direction: self.direction,
            partner: self.partner,
            my_private: *self.my_private.to_bytes(),
            partner_public: *self.partner_public.as_bytes(),
            relationship: self.relationship,
            base_key: *self.base_key.as_bytes(),
            params: self.params,
            ttl: self.ttl,
            trigger: self.trigger,
            negotiation: negotiation.persisted(),
        };

        let key = Self::storage_key(&self.id);
        save_cbor(&self.storage, &key, SESSION_VERSION, &stored).map_err(|e| {
            tracing::error!(session = %self.id, error = %e, "session write failed");
            RatchetError::persistence(key, e)
        })
    }
}

impl<S: Storage> fmt::Display for Session<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} session {} with {}", self.direction, self.id, self.partner)
    }
}

impl<S: Storage> fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("partner", &self.partner)
            .field("ttl", &self.ttl)
            .field("negotiation", &self.negotiation_status())
            .field("state_vector", &self.state_vector)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        storage::{ChaoticStorage, MemoryStorage},
        test_env::TestEnv,
    };

    fn scenario_params() -> SessionParams {
        // ttl = 20, num_keys = ceil(20 * 5.0) = 100
        SessionParams {
            min_keys: 20,
            max_keys: 21,
            num_rekeys: 5,
            ttl_scalar: 5.0,
            min_num_keys: 0,
            unconfirmed_retry_ratio: 0.0,
        }
    }

    fn seed(direction: Direction, negotiation: NegotiationStatus) -> SessionSeed {
        SessionSeed {
            direction,
            partner: PartnerId::from_bytes([9; 32]),
            my_private: Some(PrivateKey::from_random_bytes([1; 32])),
            partner_public: PrivateKey::from_random_bytes([2; 32]).public_key(),
            relationship: [3; 32],
            base_key: None,
            trigger: SessionId::default(),
            negotiation,
            params: scenario_params(),
        }
    }

    fn generate(
        direction: Direction,
        negotiation: NegotiationStatus,
    ) -> (Arc<Session<MemoryStorage>>, Fingerprints<MemoryStorage>, MemoryStorage) {
        let storage = MemoryStorage::new();
        let fingerprints = Fingerprints::new();
        let session = Session::generate(
            seed(direction, negotiation),
            storage.clone(),
            &TestEnv::with_seed(1),
            &fingerprints,
        )
        .unwrap();
        (session, fingerprints, storage)
    }

    #[test]
    fn pool_shape_follows_params() {
        let (session, _, _) = generate(Direction::Send, NegotiationStatus::Confirmed);

        assert_eq!(session.ttl(), 20);
        assert_eq!(session.num_keys(), 100);
        assert_eq!(session.status(), SessionStatus::Active);
    }

    #[test]
    fn reserve_inflates_small_pools() {
        let storage = MemoryStorage::new();
        let mut seed = seed(Direction::Send, NegotiationStatus::Confirmed);
        seed.params.ttl_scalar = 1.0;

        let session =
            Session::generate(seed, storage, &TestEnv::with_seed(1), &Fingerprints::new()).unwrap();

        assert_eq!(session.num_keys(), 25);
        assert!(session.num_keys() - session.ttl() >= session.params().num_rekeys);
    }

    #[test]
    fn ordinary_keys_stop_at_rekey_reserve() {
        let (session, _, _) = generate(Direction::Send, NegotiationStatus::Confirmed);

        for expected in 0..79 {
            assert_eq!(session.pop_key().unwrap().index(), expected);
        }
        assert_eq!(session.num_available(), 21);
        assert_eq!(session.status(), SessionStatus::RekeyNeeded);

        for _ in 79..95 {
            session.pop_key().unwrap();
        }
        assert_eq!(session.num_available(), 5);
        assert_eq!(session.status(), SessionStatus::Empty);
        assert!(matches!(session.pop_key(), Err(RatchetError::ReservedForRekey { .. })));

        for expected in 95..100 {
            assert_eq!(session.pop_rekey().unwrap().index(), expected);
        }
        assert_eq!(session.status(), SessionStatus::RekeyEmpty);
        assert!(matches!(session.pop_rekey(), Err(RatchetError::KeysExhausted { .. })));
    }

    #[test]
    fn status_thresholds() {
        let (session, _, _) = generate(Direction::Send, NegotiationStatus::Confirmed);

        for _ in 0..19 {
            session.pop_key().unwrap();
        }
        assert_eq!(session.status(), SessionStatus::Active);

        session.pop_key().unwrap();
        assert_eq!(session.status(), SessionStatus::RekeyNeeded);
    }

    #[test]
    fn receive_session_registers_all_keys() {
        let (session, fingerprints, _) = generate(Direction::Receive, NegotiationStatus::Confirmed);

        assert_eq!(fingerprints.len(), 100);
        let key = session.unused_keys().remove(3);
        assert!(fingerprints.check(&key.fingerprint()));
    }

    #[test]
    fn send_session_registers_nothing() {
        let (_, fingerprints, _) = generate(Direction::Send, NegotiationStatus::Sending);

        assert!(fingerprints.is_empty());
    }

    #[test]
    fn legal_transition_table() {
        use NegotiationStatus::{
            Confirmed, NewSessionCreated, NewSessionTriggered, Sending, Sent, Unconfirmed,
        };

        assert!(Unconfirmed.can_transition_to(Sending));
        assert!(Sending.can_transition_to(Sent));
        assert!(Sending.can_transition_to(Unconfirmed));
        assert!(Sent.can_transition_to(Confirmed));
        assert!(Confirmed.can_transition_to(NewSessionTriggered));
        assert!(NewSessionTriggered.can_transition_to(NewSessionCreated));

        assert!(!Confirmed.can_transition_to(Unconfirmed));
        assert!(!NewSessionCreated.can_transition_to(Sending));
        assert!(!Unconfirmed.can_transition_to(Sent));
    }

    #[test]
    fn illegal_transition_changes_nothing() {
        let (session, _, _) = generate(Direction::Send, NegotiationStatus::Unconfirmed);

        let result = session.set_negotiation_status(NegotiationStatus::NewSessionCreated);

        assert!(matches!(result, Err(RatchetError::IllegalTransition { .. })));
        assert_eq!(session.negotiation_status(), NegotiationStatus::Unconfirmed);
    }

    #[test]
    fn confirm_is_idempotent() {
        let (session, _, _) = generate(Direction::Send, NegotiationStatus::Sent);

        session.confirm().unwrap();
        session.confirm().unwrap();

        assert_eq!(session.negotiation_status(), NegotiationStatus::Confirmed);
    }

    #[test]
    fn in_flight_states_persist_as_fallback() {
        let (session, fingerprints, storage) = generate(Direction::Send, NegotiationStatus::Unconfirmed);
        session.set_negotiation_status(NegotiationStatus::Sending).unwrap();

        let loaded = Session::load(storage, session.id(), &fingerprints).unwrap();

        assert_eq!(loaded.negotiation_status(), NegotiationStatus::Unconfirmed);
    }

    #[test]
    fn reload_restores_usage_and_fingerprints() {
        let (session, _, storage) = generate(Direction::Receive, NegotiationStatus::Confirmed);
        session.use_key(0).unwrap();
        session.use_key(4).unwrap();

        let fingerprints = Fingerprints::new();
        let loaded = Session::load(storage, session.id(), &fingerprints).unwrap();

        assert_eq!(loaded.used_key_nums(), vec![0, 4]);
        assert_eq!(loaded.ttl(), session.ttl());
        assert_eq!(fingerprints.len(), 98);
    }

    #[test]
    fn trigger_on_exhausted_confirmed_session() {
        let (session, _, _) = generate(Direction::Send, NegotiationStatus::Confirmed);
        let env = TestEnv::with_seed(3);

        assert!(!session.trigger_negotiation(&env));
        for _ in 0..20 {
            session.pop_key().unwrap();
        }

        assert!(session.trigger_negotiation(&env));
        assert_eq!(session.negotiation_status(), NegotiationStatus::NewSessionTriggered);
        assert!(!session.trigger_negotiation(&env));
    }

    #[test]
    fn trigger_reannounces_unconfirmed_session_needing_rekey() {
        let (session, _, _) = generate(Direction::Send, NegotiationStatus::Unconfirmed);
        let env = TestEnv::with_seed(3);

        assert!(!session.trigger_negotiation(&env));
        for _ in 0..20 {
            session.pop_key().unwrap();
        }

        assert!(session.trigger_negotiation(&env));
        assert_eq!(session.negotiation_status(), NegotiationStatus::Sending);
    }

    #[test]
    fn retry_ratio_one_always_reannounces() {
        let storage = MemoryStorage::new();
        let mut seed = seed(Direction::Send, NegotiationStatus::Unconfirmed);
        seed.params.unconfirmed_retry_ratio = 1.0;
        let session =
            Session::generate(seed, storage, &TestEnv::with_seed(1), &Fingerprints::new()).unwrap();

        assert!(session.trigger_negotiation(&TestEnv::with_seed(2)));
        assert_eq!(session.negotiation_status(), NegotiationStatus::Sending);
    }

    #[test]
    fn delete_unregisters_unused_keys() {
        let (session, fingerprints, storage) = generate(Direction::Receive, NegotiationStatus::Confirmed);

        session.delete(&fingerprints).unwrap();

        assert!(fingerprints.is_empty());
        assert!(storage.keys_with_prefix("session/").is_empty());
    }

    #[test]
    fn failed_status_write_rolls_back() {
        let storage = ChaoticStorage::new(MemoryStorage::new(), 0.0);
        let session = Session::generate(
            seed(Direction::Send, NegotiationStatus::Sending),
            storage.clone(),
            &TestEnv::with_seed(1),
            &Fingerprints::new(),
        )
        .unwrap();

        storage.set_failure_rate(1.0);
        let result = session.set_negotiation_status(NegotiationStatus::Sent);

        assert!(result.is_err_and(|e| e.is_fatal()));
        assert_eq!(session.negotiation_status(), NegotiationStatus::Sending);
    }

    #[test]
    fn generated_private_key_comes_from_environment() {
        let storage = MemoryStorage::new();
        let mut a = seed(Direction::Send, NegotiationStatus::Sending);
        a.my_private = None;
        let b = a.clone();

        let first = Session::generate(a, storage.clone(), &TestEnv::with_seed(7), &Fingerprints::new())
            .unwrap();
        let second =
            Session::generate(b, storage, &TestEnv::with_seed(7), &Fingerprints::new()).unwrap();

        assert_eq!(first.id(), second.id());
    }
}
