//! Registry mapping wire fingerprints to unused receive keys.
//!
//! Shared by the store and every relationship. A fingerprint is present
//! exactly while its key is unused and its session exists.

#![allow(clippy::disallowed_types, reason = "Synchronous locking operations only")]
#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{collections::HashMap, sync::RwLock};

use ratchetmix_crypto::Fingerprint;

use crate::{error::RatchetError, key::Key, storage::Storage};

/// Fingerprint to key lookup for incoming messages.
pub struct Fingerprints<S: Storage> {
    keys: RwLock<HashMap<Fingerprint, Key<S>>>,
}

impl<S: Storage> Fingerprints<S> {
    /// Empty registry.
    pub fn new() -> Self {
        Self { keys: RwLock::new(HashMap::new()) }
    }

    /// Register `keys` under their fingerprints.
    pub fn add(&self, keys: impl IntoIterator<Item = Key<S>>) {
        let mut map = self.keys.write().expect("fingerprint lock poisoned");
        for key in keys {
            map.insert(key.fingerprint(), key);
        }
    }

    /// Unregister `fingerprints`. Unknown entries are ignored.
    pub fn remove(&self, fingerprints: impl IntoIterator<Item = Fingerprint>) {
        let mut map = self.keys.write().expect("fingerprint lock poisoned");
        for fingerprint in fingerprints {
            map.remove(&fingerprint);
        }
    }

    /// Whether `fingerprint` names an unused key.
    pub fn check(&self, fingerprint: &Fingerprint) -> bool {
        self.keys.read().expect("fingerprint lock poisoned").contains_key(fingerprint)
    }

    /// Key for `fingerprint` without consuming it.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Key<S>> {
        self.keys.read().expect("fingerprint lock poisoned").get(fingerprint).cloned()
    }

    /// Consume the key for `fingerprint`.
    ///
    /// The entry is removed before the key is marked used, so a second
    /// lookup of the same fingerprint fails even if the write fails.
    ///
    /// # Errors
    ///
    /// - `UnknownFingerprint` if no unused key matches
    /// - `Persistence` if marking the key used fails
    pub fn pop(&self, fingerprint: &Fingerprint) -> Result<Key<S>, RatchetError> {
        let key = self
            .keys
            .write()
            .expect("fingerprint lock poisoned")
            .remove(fingerprint)
            .ok_or(RatchetError::UnknownFingerprint)?;

        key.denote_use()?;
        Ok(key)
    }

    /// Number of registered keys.
    pub fn len(&self) -> usize {
        self.keys.read().expect("fingerprint lock poisoned").len()
    }

    /// Returns `true` if no keys are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every registered fingerprint.
    pub fn fingerprints(&self) -> Vec<Fingerprint> {
        self.keys.read().expect("fingerprint lock poisoned").keys().copied().collect()
    }
}

impl<S: Storage> Default for Fingerprints<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Storage> std::fmt::Debug for Fingerprints<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fingerprints").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use ratchetmix_crypto::PrivateKey;
    use ratchetmix_proto::{PartnerId, SessionId};

    use super::*;
    use crate::{
        params::SessionParams,
        session::{Direction, NegotiationStatus, Session, SessionSeed},
        storage::MemoryStorage,
        test_env::TestEnv,
    };

    fn receive_session(fingerprints: &Fingerprints<MemoryStorage>) -> std::sync::Arc<Session<MemoryStorage>> {
        let seed = SessionSeed {
            direction: Direction::Receive,
            partner: PartnerId::from_bytes([4; 32]),
            my_private: Some(PrivateKey::from_random_bytes([5; 32])),
            partner_public: PrivateKey::from_random_bytes([6; 32]).public_key(),
            relationship: [8; 32],
            base_key: None,
            trigger: SessionId::default(),
            negotiation: NegotiationStatus::Confirmed,
            params: SessionParams {
                min_keys: 20,
                max_keys: 30,
                num_rekeys: 5,
                ttl_scalar: 2.0,
                min_num_keys: 0,
                unconfirmed_retry_ratio: 0.0,
            },
        };
        Session::generate(seed, MemoryStorage::new(), &TestEnv::with_seed(0), fingerprints).unwrap()
    }

    #[test]
    fn pop_consumes_once() {
        let fingerprints = Fingerprints::new();
        let session = receive_session(&fingerprints);
        let before = fingerprints.len();
        let fingerprint = session.unused_keys()[2].fingerprint();

        let key = fingerprints.pop(&fingerprint).unwrap();

        assert_eq!(key.index(), 2);
        assert!(session.used_key_nums().contains(&2));
        assert_eq!(fingerprints.len(), before - 1);
        assert_eq!(fingerprints.pop(&fingerprint).unwrap_err(), RatchetError::UnknownFingerprint);
    }

    #[test]
    fn check_does_not_consume() {
        let fingerprints = Fingerprints::new();
        let session = receive_session(&fingerprints);
        let fingerprint = session.unused_keys()[0].fingerprint();

        assert!(fingerprints.check(&fingerprint));
        assert!(fingerprints.check(&fingerprint));
        assert!(session.used_key_nums().is_empty());
    }

    #[test]
    fn remove_ignores_unknown() {
        let fingerprints: Fingerprints<MemoryStorage> = Fingerprints::new();

        fingerprints.remove([Fingerprint::from_bytes([0; 32])]);

        assert!(fingerprints.is_empty());
    }
}
