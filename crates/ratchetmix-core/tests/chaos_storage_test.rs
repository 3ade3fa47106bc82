//! Key accounting under injected storage failures.
//!
//! A failed write must surface as a fatal error and leave memory no further
//! ahead than disk: after any sequence of failures, reloading the store from
//! the underlying storage must show exactly the keys that were handed out.

use std::collections::{BTreeSet, HashMap};

use proptest::prelude::*;
use ratchetmix_core::{
    ChaoticStorage, Environment, MemoryStorage, SessionParams, Store,
};
use ratchetmix_crypto::PrivateKey;
use ratchetmix_harness::{InvariantRegistry, SimEnv, StoreSnapshot};
use ratchetmix_proto::{PartnerId, SessionId};

fn key(env: &SimEnv) -> PrivateKey {
    let mut bytes = [0u8; 32];
    env.random_bytes(&mut bytes);
    PrivateKey::from_random_bytes(bytes)
}

fn partner() -> PartnerId {
    PartnerId::from_bytes([0xB1; 32])
}

fn chaotic_store(seed: u64) -> (Store<ChaoticStorage<MemoryStorage>, SimEnv>, ChaoticStorage<MemoryStorage>) {
    let env = SimEnv::with_seed(seed);
    let storage = ChaoticStorage::with_seed(MemoryStorage::new(), 0.0, seed);
    let store = Store::new(storage.clone(), env.clone(), PartnerId::from_bytes([0xA1; 32])).unwrap();
    store
        .add_partner(
            partner(),
            key(&env).public_key(),
            key(&env),
            SessionParams::default(),
            SessionParams::default(),
        )
        .unwrap();
    (store, storage)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// INVARIANT: every send key handed out is on disk as used, and nothing
    /// else is.
    #[test]
    fn handed_out_send_keys_match_disk(seed in any::<u64>(), failure_rate in 0.0f64..0.6, pops in 1usize..80) {
        let (store, storage) = chaotic_store(seed);
        let manager = store.get_partner(&partner()).unwrap();
        storage.set_failure_rate(failure_rate);

        let mut handed: HashMap<SessionId, BTreeSet<u32>> = HashMap::new();
        for _ in 0..pops {
            match manager.pop_send_key() {
                Ok(key) => {
                    prop_assert!(handed.entry(key.session().id()).or_default().insert(key.index()));
                },
                Err(e) => prop_assert!(e.is_fatal(), "unexpected error: {e}"),
            }
        }

        let reloaded = Store::load(storage.inner().clone(), SimEnv::with_seed(seed)).unwrap();
        let manager = reloaded.get_partner(&partner()).unwrap();
        for session in manager.send_relationship().sessions() {
            let on_disk: BTreeSet<u32> = session.used_key_nums().into_iter().collect();
            let expected = handed.remove(&session.id()).unwrap_or_default();
            prop_assert_eq!(on_disk, expected);
        }
    }

    /// INVARIANT: consuming receive keys under failures keeps the registry
    /// and the state vectors consistent, in memory and after reload.
    #[test]
    fn receive_registry_stays_consistent(seed in any::<u64>(), failure_rate in 0.0f64..0.6, pops in 1usize..60) {
        let (store, storage) = chaotic_store(seed);
        storage.set_failure_rate(failure_rate);

        let mut consumed = Vec::new();
        for fingerprint in store.fingerprints().fingerprints().into_iter().take(pops) {
            match store.pop_key(&fingerprint) {
                Ok(_) => consumed.push(fingerprint),
                Err(e) => prop_assert!(e.is_fatal(), "unexpected error: {e}"),
            }
        }

        storage.set_failure_rate(0.0);
        let reloaded = Store::load(storage.inner().clone(), SimEnv::with_seed(seed)).unwrap();
        for fingerprint in &consumed {
            prop_assert!(!reloaded.check_key(fingerprint));
        }

        let registry = InvariantRegistry::standard();
        prop_assert!(registry.check_all(&StoreSnapshot::capture(&reloaded)).is_ok());
    }
}

#[test]
fn failing_storage_rejects_new_partner_cleanly() {
    let (store, storage) = chaotic_store(5);
    storage.set_failure_rate(1.0);

    let env = SimEnv::with_seed(6);
    let other = PartnerId::from_bytes([0xC1; 32]);
    let result = store.add_partner(
        other,
        key(&env).public_key(),
        key(&env),
        SessionParams::default(),
        SessionParams::default(),
    );

    assert!(result.unwrap_err().is_fatal());
    assert!(store.get_partner(&other).is_err());
    assert_eq!(store.partners(), vec![partner()]);
}
