//! Top-level ratchet state for one client.
//!
//! Owns the partner map and the fingerprint registry. One store is built per
//! client instance and shared by handle with the send path, the receive path
//! and the negotiation driver.

#![allow(clippy::disallowed_types, reason = "Synchronous locking operations only")]
#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use ratchetmix_crypto::{Fingerprint, PrivateKey, PublicKey};
use ratchetmix_proto::PartnerId;
use serde::{Deserialize, Serialize};

use crate::{
    env::Environment,
    error::RatchetError,
    fingerprints::Fingerprints,
    key::Key,
    manager::Manager,
    params::SessionParams,
    storage::{Storage, load_cbor, save_cbor},
};

const STORE_VERSION: u64 = 0;
const STORE_KEY: &str = "store/partners";

#[derive(Serialize, Deserialize)]
struct StoredStore {
    my_id: PartnerId,
    partners: Vec<PartnerId>,
}

/// Partner map plus the receive-side fingerprint registry.
pub struct Store<S: Storage, E: Environment> {
    my_id: PartnerId,
    managers: RwLock<HashMap<PartnerId, Arc<Manager<S>>>>,
    fingerprints: Arc<Fingerprints<S>>,
    storage: S,
    env: E,
}

impl<S: Storage, E: Environment> Store<S, E> {
    /// Create an empty store for the client `my_id` and persist it.
    pub fn new(storage: S, env: E, my_id: PartnerId) -> Result<Self, RatchetError> {
        let store = Self {
            my_id,
            managers: RwLock::new(HashMap::new()),
            fingerprints: Arc::new(Fingerprints::new()),
            storage,
            env,
        };
        store.save(&[])?;
        Ok(store)
    }

    /// Rebuild a store from storage.
    ///
    /// Loads every partner, relationship, session and state vector, and
    /// re-registers every unused receive key.
    pub fn load(storage: S, env: E) -> Result<Self, RatchetError> {
        let stored: StoredStore = load_cbor(&storage, STORE_KEY, STORE_VERSION)
            .map_err(|e| RatchetError::persistence(STORE_KEY, e))?;

        let fingerprints = Arc::new(Fingerprints::new());
        let mut managers = HashMap::with_capacity(stored.partners.len());
        for partner in stored.partners {
            let manager = Manager::load(storage.clone(), partner, Arc::clone(&fingerprints))?;
            managers.insert(partner, Arc::new(manager));
        }

        tracing::info!(
            my_id = %stored.my_id,
            partners = managers.len(),
            receive_keys = fingerprints.len(),
            "store loaded"
        );

        Ok(Self { my_id: stored.my_id, managers: RwLock::new(managers), fingerprints, storage, env })
    }

    /// This client's own identity.
    pub fn my_id(&self) -> PartnerId {
        self.my_id
    }

    /// Environment used for key generation and negotiation draws.
    pub fn env(&self) -> &E {
        &self.env
    }

    /// Backing storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Add a partner and bootstrap its ratchet.
    ///
    /// # Errors
    ///
    /// - `PartnerExists` if the partner is already present
    /// - `InvalidParams` if either parameter set is unusable
    /// - `Persistence` if a write fails
    pub fn add_partner(
        &self,
        partner: PartnerId,
        partner_public: PublicKey,
        my_private: PrivateKey,
        send_params: SessionParams,
        receive_params: SessionParams,
    ) -> Result<Arc<Manager<S>>, RatchetError> {
        let mut managers = self.managers.write().expect("partner map lock poisoned");
        if managers.contains_key(&partner) {
            return Err(RatchetError::PartnerExists(partner));
        }

        let manager = Arc::new(Manager::new(
            self.storage.clone(),
            self.my_id,
            partner,
            partner_public,
            my_private,
            send_params,
            receive_params,
            Arc::clone(&self.fingerprints),
            &self.env,
        )?);
        managers.insert(partner, Arc::clone(&manager));

        let partners: Vec<PartnerId> = managers.keys().copied().collect();
        if let Err(e) = self.save(&partners) {
            managers.remove(&partner);
            if let Err(cleanup) = manager.delete() {
                tracing::error!(%partner, error = %cleanup, "rollback cleanup failed");
            }
            return Err(e);
        }

        Ok(manager)
    }

    /// Manager for `partner`.
    ///
    /// # Errors
    ///
    /// - `UnknownPartner` if the partner is not present
    pub fn get_partner(&self, partner: &PartnerId) -> Result<Arc<Manager<S>>, RatchetError> {
        self.managers
            .read()
            .expect("partner map lock poisoned")
            .get(partner)
            .cloned()
            .ok_or(RatchetError::UnknownPartner(*partner))
    }

    /// Remove `partner` and all of its ratchet state.
    ///
    /// # Errors
    ///
    /// - `UnknownPartner` if the partner is not present
    /// - `Persistence` if a write fails
    pub fn delete_partner(&self, partner: &PartnerId) -> Result<(), RatchetError> {
        let mut managers = self.managers.write().expect("partner map lock poisoned");
        let manager = managers.remove(partner).ok_or(RatchetError::UnknownPartner(*partner))?;

        let partners: Vec<PartnerId> = managers.keys().copied().collect();
        if let Err(e) = self.save(&partners) {
            managers.insert(*partner, manager);
            return Err(e);
        }

        manager.delete()
    }

    /// Every known partner.
    pub fn partners(&self) -> Vec<PartnerId> {
        self.managers.read().expect("partner map lock poisoned").keys().copied().collect()
    }

    /// Snapshot of every manager.
    pub fn managers(&self) -> Vec<Arc<Manager<S>>> {
        self.managers.read().expect("partner map lock poisoned").values().cloned().collect()
    }

    /// Consume the receive key for `fingerprint`.
    ///
    /// The single receive-path entry point.
    ///
    /// # Errors
    ///
    /// - `UnknownFingerprint` if the key was never issued or is already used
    /// - `Persistence` if marking the key used fails
    pub fn pop_key(&self, fingerprint: &Fingerprint) -> Result<Key<S>, RatchetError> {
        self.fingerprints.pop(fingerprint)
    }

    /// Whether `fingerprint` names an unused receive key.
    pub fn check_key(&self, fingerprint: &Fingerprint) -> bool {
        self.fingerprints.check(fingerprint)
    }

    /// The receive-key registry.
    pub fn fingerprints(&self) -> &Arc<Fingerprints<S>> {
        &self.fingerprints
    }

    fn save(&self, partners: &[PartnerId]) -> Result<(), RatchetError> {
        let mut partners = partners.to_vec();
        partners.sort();
        let stored = StoredStore { my_id: self.my_id, partners };
        save_cbor(&self.storage, STORE_KEY, STORE_VERSION, &stored).map_err(|e| {
            tracing::error!(error = %e, "store write failed");
            RatchetError::persistence(STORE_KEY, e)
        })
    }
}

impl<S: Storage, E: Environment> std::fmt::Debug for Store<S, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("my_id", &self.my_id)
            .field("partners", &self.partners().len())
            .field("fingerprints", &self.fingerprints)
            .finish_non_exhaustive()
    }
}
