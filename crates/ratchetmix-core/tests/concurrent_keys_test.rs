//! Key handout under contention.
//!
//! Several threads draining one pool at once must never receive the same
//! index twice, and ordinary traffic must never dip into the rekey reserve.

use std::{collections::BTreeSet, sync::Mutex, thread};

use ratchetmix_core::{
    Environment, MemoryStorage, RatchetError, SessionParams, StateVector, Store,
};
use ratchetmix_crypto::PrivateKey;
use ratchetmix_harness::SimEnv;
use ratchetmix_proto::{PartnerId, SessionId};

const THREADS: usize = 8;

fn key(env: &SimEnv) -> PrivateKey {
    let mut bytes = [0u8; 32];
    env.random_bytes(&mut bytes);
    PrivateKey::from_random_bytes(bytes)
}

fn partner() -> PartnerId {
    PartnerId::from_bytes([0xC4; 32])
}

fn store(seed: u64) -> Store<MemoryStorage, SimEnv> {
    let env = SimEnv::with_seed(seed);
    let store = Store::new(MemoryStorage::new(), env.clone(), PartnerId::from_bytes([0xA1; 32]))
        .unwrap();
    store
        .add_partner(
            partner(),
            key(&env).public_key(),
            key(&env),
            SessionParams::default(),
            SessionParams::default(),
        )
        .unwrap();
    store
}

/// Drain `pop` from every thread until it fails, collecting what each got.
fn drain<F>(pop: F) -> Vec<u32>
where
    F: Fn() -> Result<u32, RatchetError> + Sync,
{
    let handed = Mutex::new(Vec::new());
    thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                let mut mine = Vec::new();
                loop {
                    match pop() {
                        Ok(index) => mine.push(index),
                        Err(e) => {
                            assert!(!e.is_fatal(), "unexpected error: {e}");
                            break;
                        },
                    }
                }
                handed.lock().unwrap().extend(mine);
            });
        }
    });
    handed.into_inner().unwrap()
}

#[test]
fn racing_state_vector_hands_out_each_index_once() {
    let vector =
        StateVector::new(MemoryStorage::new(), SessionId::from_bytes([3; 32]), 500).unwrap();

    let handed = drain(|| vector.next_with_reserve(40));

    let distinct: BTreeSet<u32> = handed.iter().copied().collect();
    assert_eq!(distinct.len(), handed.len());
    assert_eq!(handed.len(), 460);
    assert_eq!(vector.num_available(), 40);
}

#[test]
fn racing_senders_stop_at_the_rekey_reserve() {
    let store = store(11);
    let manager = store.get_partner(&partner()).unwrap();
    let session = manager.send_relationship().sessions()[0].clone();
    let reserve = session.params().num_rekeys;

    let handed = drain(|| {
        let key = manager.pop_send_key()?;
        assert_eq!(key.session().id(), session.id());
        Ok(key.index())
    });

    let distinct: BTreeSet<u32> = handed.iter().copied().collect();
    assert_eq!(distinct.len(), handed.len());
    assert_eq!(handed.len() as u32, session.num_keys() - reserve);
    assert_eq!(session.num_available(), reserve);

    let rekeys = drain(|| manager.pop_rekey_key().map(|key| key.index()));

    let all: BTreeSet<u32> = handed.iter().chain(&rekeys).copied().collect();
    assert_eq!(rekeys.len() as u32, reserve);
    assert_eq!(all.len() as u32, session.num_keys());
    assert_eq!(session.num_available(), 0);
}

#[test]
fn racing_receivers_claim_a_fingerprint_once() {
    let store = store(12);
    let manager = store.get_partner(&partner()).unwrap();
    let fingerprints: Vec<_> = manager.receive_relationship().sessions()[0]
        .unused_keys()
        .iter()
        .take(64)
        .map(|key| key.fingerprint())
        .collect();

    let claimed = Mutex::new(0usize);
    thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                for fingerprint in &fingerprints {
                    if let Ok(key) = store.pop_key(fingerprint) {
                        key.denote_use().unwrap();
                        *claimed.lock().unwrap() += 1;
                    }
                }
            });
        }
    });

    assert_eq!(claimed.into_inner().unwrap(), fingerprints.len());
    let used = manager.receive_relationship().sessions()[0].used_key_nums();
    assert_eq!(used.len(), fingerprints.len());
}
