//! Per-partner pairing of the send and receive relationships.
//!
//! # Session chaining
//!
//! A new send session is keyed from a fresh private key and the partner
//! public key of the newest usable receive session `R`, and names `R` as its
//! trigger. The partner's send session mirroring `R` has the same ID (same DH
//! pair, same base key), so the partner finds it from the trigger and pairs
//! its private key with the announced public key:
//!
//! ```text
//! me:      R = DH(a, B)   ──►  new send    = DH(a', B)
//!                                               ║  (same base key)
//! partner: R' = DH(b, A)  ──►  new receive = DH(b, A')
//! ```

use std::sync::Arc;

use ratchetmix_crypto::{
    PrivateKey, PublicKey, connection_fingerprint, relationship_fingerprint, session_base_key,
    session_id,
};
use ratchetmix_proto::{PartnerId, SessionId};
use serde::{Deserialize, Serialize};

use crate::{
    env::Environment,
    error::RatchetError,
    fingerprints::Fingerprints,
    key::Key,
    params::SessionParams,
    relationship::Relationship,
    session::{Direction, NegotiationStatus, Session, SessionSeed},
    storage::{Storage, load_cbor, save_cbor},
};

const MANAGER_VERSION: u64 = 0;

#[derive(Serialize, Deserialize)]
struct StoredManager {
    origin_my_private: [u8; 32],
    origin_partner_public: [u8; 32],
    send_params: SessionParams,
    receive_params: SessionParams,
}

/// Ratchet state for one partner.
pub struct Manager<S: Storage> {
    partner: PartnerId,
    origin_my_private: PrivateKey,
    origin_partner_public: PublicKey,
    send_params: SessionParams,
    receive_params: SessionParams,
    send: Relationship<S>,
    receive: Relationship<S>,
    storage: S,
}

impl<S: Storage> Manager<S> {
    /// Create the ratchet for a new partner and persist it.
    ///
    /// Bootstraps one confirmed Send and one confirmed Receive session from
    /// the origin key pair. The partner does the same with the mirrored pair.
    #[allow(clippy::too_many_arguments, reason = "Partner setup needs every origin input")]
    pub fn new<E: Environment>(
        storage: S,
        my_id: PartnerId,
        partner: PartnerId,
        partner_public: PublicKey,
        my_private: PrivateKey,
        send_params: SessionParams,
        receive_params: SessionParams,
        fingerprints: Arc<Fingerprints<S>>,
        env: &E,
    ) -> Result<Self, RatchetError> {
        send_params.validate()?;
        receive_params.validate()?;

        let my_public = my_private.public_key();
        let send_fingerprint = relationship_fingerprint(
            my_public.as_bytes(),
            partner_public.as_bytes(),
            my_id.as_bytes(),
            partner.as_bytes(),
        );
        let receive_fingerprint = relationship_fingerprint(
            partner_public.as_bytes(),
            my_public.as_bytes(),
            partner.as_bytes(),
            my_id.as_bytes(),
        );

        let send = Relationship::new(
            storage.clone(),
            partner,
            Direction::Send,
            send_fingerprint,
            Arc::clone(&fingerprints),
        )?;
        let receive = Relationship::new(
            storage.clone(),
            partner,
            Direction::Receive,
            receive_fingerprint,
            fingerprints,
        )?;

        let manager = Self {
            partner,
            origin_my_private: my_private,
            origin_partner_public: partner_public,
            send_params,
            receive_params,
            send,
            receive,
            storage,
        };
        manager.save()?;

        for (relationship, params) in
            [(&manager.send, send_params), (&manager.receive, receive_params)]
        {
            let seed = manager.seed(
                Some(manager.origin_my_private.clone()),
                partner_public,
                SessionId::default(),
                NegotiationStatus::Confirmed,
                params,
            );
            relationship.add_session(seed, env)?;
        }

        tracing::info!(
            %partner,
            connection = %manager.connection_fingerprint_hex(),
            "partner ratchet created"
        );

        Ok(manager)
    }

    /// Load a persisted manager and both relationships.
    pub fn load(
        storage: S,
        partner: PartnerId,
        fingerprints: Arc<Fingerprints<S>>,
    ) -> Result<Self, RatchetError> {
        let key = Self::storage_key(&partner);
        let stored: StoredManager = load_cbor(&storage, &key, MANAGER_VERSION)
            .map_err(|e| RatchetError::persistence(key, e))?;

        let send =
            Relationship::load(storage.clone(), partner, Direction::Send, Arc::clone(&fingerprints))?;
        let receive =
            Relationship::load(storage.clone(), partner, Direction::Receive, fingerprints)?;

        Ok(Self {
            partner,
            origin_my_private: PrivateKey::from_random_bytes(stored.origin_my_private),
            origin_partner_public: PublicKey::from_bytes(stored.origin_partner_public),
            send_params: stored.send_params,
            receive_params: stored.receive_params,
            send,
            receive,
            storage,
        })
    }

    /// Storage key for the manager of `partner`.
    pub fn storage_key(partner: &PartnerId) -> String {
        format!("partner/{}/manager", partner.to_hex())
    }

    /// Partner this manager is for.
    pub fn partner(&self) -> PartnerId {
        self.partner
    }

    /// Own public key the partnership was established with.
    pub fn origin_my_public_key(&self) -> PublicKey {
        self.origin_my_private.public_key()
    }

    /// Partner public key the partnership was established with.
    pub fn origin_partner_public_key(&self) -> PublicKey {
        self.origin_partner_public
    }

    /// Parameters for new send sessions.
    pub fn send_params(&self) -> SessionParams {
        self.send_params
    }

    /// Parameters for new receive sessions.
    pub fn receive_params(&self) -> SessionParams {
        self.receive_params
    }

    /// Outgoing relationship.
    pub fn send_relationship(&self) -> &Relationship<S> {
        &self.send
    }

    /// Incoming relationship.
    pub fn receive_relationship(&self) -> &Relationship<S> {
        &self.receive
    }

    /// Create a receive session for a partner rekey.
    ///
    /// `source` is this client's send session named by the trigger. The new
    /// session pairs its private key with the announced `partner_public` and
    /// is confirmed immediately. Returns `true` in the flag if the session
    /// already existed (retransmitted trigger).
    pub fn new_receive_session<E: Environment>(
        &self,
        partner_public: PublicKey,
        params: SessionParams,
        source: &Session<S>,
        env: &E,
    ) -> Result<(Arc<Session<S>>, bool), RatchetError> {
        let seed = self.seed(
            Some(source.my_private_key().clone()),
            partner_public,
            source.id(),
            NegotiationStatus::Confirmed,
            params,
        );
        let (session, duplicate) = self.receive.add_session(seed, env)?;

        if !duplicate {
            tracing::info!(
                partner = %self.partner,
                session = %session.id(),
                source = %source.id(),
                "receive session created from partner rekey"
            );
        }
        Ok((session, duplicate))
    }

    /// Create a send session to announce to the partner.
    ///
    /// Keyed from `my_private` (generated when `None`) and the partner public
    /// key of the newest usable receive session, which becomes the trigger.
    /// With none usable, the newest receive session is used regardless of
    /// state, and an empty relationship falls back to the bootstrap session.
    /// Starts `Sending`, ready for announcement.
    pub fn new_send_session<E: Environment>(
        &self,
        my_private: Option<PrivateKey>,
        params: SessionParams,
        env: &E,
    ) -> Result<Arc<Session<S>>, RatchetError> {
        // Any receive session has a mirrored send session on the partner, so
        // an exhausted one still names a trigger the partner can resolve.
        let source = self
            .receive
            .newest_rekeyable_session()
            .or_else(|| self.receive.sessions().into_iter().next());
        let (partner_public, trigger) = match source {
            Some(source) => (source.partner_public_key(), source.id()),
            None => (self.origin_partner_public, self.origin_receive_session_id()),
        };

        let seed = self.seed(my_private, partner_public, trigger, NegotiationStatus::Sending, params);
        let (session, _) = self.send.add_session(seed, env)?;

        tracing::info!(
            partner = %self.partner,
            session = %session.id(),
            %trigger,
            "send session created"
        );
        Ok(session)
    }

    /// ID of the session both sides bootstrapped from the origin key pair.
    fn origin_receive_session_id(&self) -> SessionId {
        let base_key = session_base_key(
            &self.origin_my_private,
            &self.origin_partner_public,
            &self.receive.fingerprint(),
        );
        SessionId::from_bytes(session_id(&base_key))
    }

    /// Send session by ID.
    pub fn get_send_session(&self, id: &SessionId) -> Option<Arc<Session<S>>> {
        self.send.get(id)
    }

    /// Receive session by ID.
    pub fn get_receive_session(&self, id: &SessionId) -> Option<Arc<Session<S>>> {
        self.receive.get(id)
    }

    /// Send session ordinary messages would use right now.
    pub fn sending_session(&self) -> Option<Arc<Session<S>>> {
        self.send.session_for_sending()
    }

    /// Key for an ordinary outgoing message.
    pub fn pop_send_key(&self) -> Result<Key<S>, RatchetError> {
        self.send.key_for_sending()
    }

    /// Key for an outgoing key-exchange message.
    pub fn pop_rekey_key(&self) -> Result<Key<S>, RatchetError> {
        self.send.key_for_rekey()
    }

    /// Record the partner's confirmation of send session `id`.
    pub fn confirm(&self, id: &SessionId) -> Result<(), RatchetError> {
        self.send.confirm(id)
    }

    /// Send sessions needing negotiation work this cycle.
    pub fn trigger_negotiations<E: Environment>(&self, env: &E) -> Vec<Arc<Session<S>>> {
        self.send.trigger_negotiation(env)
    }

    /// Fingerprint of the whole partnership. Both partners compute the same
    /// value.
    pub fn connection_fingerprint(&self) -> [u8; 32] {
        connection_fingerprint(&self.send.fingerprint(), &self.receive.fingerprint())
    }

    /// Short hex form of [`Self::connection_fingerprint`] for display.
    pub fn connection_fingerprint_hex(&self) -> String {
        self.connection_fingerprint()[..8].iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Delete both relationships and the manager record.
    pub fn delete(&self) -> Result<(), RatchetError> {
        self.send.delete()?;
        self.receive.delete()?;

        let key = Self::storage_key(&self.partner);
        self.storage.delete(&key, MANAGER_VERSION).map_err(|e| RatchetError::persistence(key, e))?;

        tracing::info!(partner = %self.partner, "partner ratchet deleted");
        Ok(())
    }

    fn seed(
        &self,
        my_private: Option<PrivateKey>,
        partner_public: PublicKey,
        trigger: SessionId,
        negotiation: NegotiationStatus,
        params: SessionParams,
    ) -> SessionSeed {
        // Relationship fills in direction, partner and fingerprint.
        SessionSeed {
            direction: Direction::Send,
            partner: self.partner,
            my_private,
            partner_public,
            relationship: [0; 32],
            base_key: None,
            trigger,
            negotiation,
            params,
        }
    }

    fn save(&self) -> Result<(), RatchetError> {
        let stored = StoredManager {
            origin_my_private: *self.origin_my_private.to_bytes(),
            origin_partner_public: *self.origin_partner_public.as_bytes(),
            send_params: self.send_params,
            receive_params: self.receive_params,
        };
        let key = Self::storage_key(&self.partner);
        save_cbor(&self.storage, &key, MANAGER_VERSION, &stored).map_err(|e| {
            tracing::error!(partner = %self.partner, error = %e, "manager write failed");
            RatchetError::persistence(key, e)
        })
    }
}

impl<S: Storage> std::fmt::Debug for Manager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("partner", &self.partner)
            .field("send", &self.send)
            .field("receive", &self.receive)
            .finish_non_exhaustive()
    }
}
