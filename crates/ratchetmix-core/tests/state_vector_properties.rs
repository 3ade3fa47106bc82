//! Property tests for key-index accounting.
//!
//! These verify the invariants every higher layer relies on:
//! - `next()` hands out each index at most once, in increasing order
//! - Used and unused indices always partition the pool
//! - What is on disk matches what was handed out

use proptest::prelude::*;
use ratchetmix_core::{MemoryStorage, RatchetError, StateVector};
use ratchetmix_proto::SessionId;

fn session() -> SessionId {
    SessionId::from_bytes([3; 32])
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// INVARIANT: `next()` returns distinct, strictly increasing indices and
    /// fails with `KeysExhausted` exactly once the pool is spent.
    #[test]
    fn next_is_strictly_increasing(num_keys in 1u32..200, pops in 0u32..260) {
        let vector = StateVector::new(MemoryStorage::new(), session(), num_keys).unwrap();

        let mut last = None;
        for i in 0..pops {
            match vector.next() {
                Ok(index) => {
                    prop_assert!(i < num_keys);
                    prop_assert!(last.is_none_or(|prev| index > prev));
                    last = Some(index);
                },
                Err(RatchetError::KeysExhausted { .. }) => prop_assert!(i >= num_keys),
                Err(e) => prop_assert!(false, "unexpected error: {e}"),
            }
        }
    }

    /// INVARIANT: after any mix of `next()` and `mark_used()`, used and
    /// unused indices partition `0..num_keys` and `num_available` agrees.
    #[test]
    fn used_and_unused_partition_the_pool(
        num_keys in 1u32..128,
        ops in prop::collection::vec(prop::option::of(0u32..140), 0..100),
    ) {
        let vector = StateVector::new(MemoryStorage::new(), session(), num_keys).unwrap();

        for op in ops {
            match op {
                Some(index) => vector.mark_used(index).unwrap(),
                None => {
                    let _ = vector.next();
                },
            }
        }

        let used = vector.used_key_nums();
        let unused = vector.unused_key_nums();
        let mut all: Vec<u32> = used.iter().chain(&unused).copied().collect();
        all.sort_unstable();

        prop_assert_eq!(all, (0..num_keys).collect::<Vec<_>>());
        prop_assert_eq!(vector.num_available() as usize, unused.len());
        for index in &used {
            prop_assert!(vector.is_used(*index));
        }
    }

    /// INVARIANT: a reloaded vector continues exactly where the original
    /// stopped; nothing handed out before the reload is handed out again.
    #[test]
    fn reload_never_repeats_an_index(num_keys in 2u32..100, before in 0u32..100) {
        let storage = MemoryStorage::new();
        let vector = StateVector::new(storage.clone(), session(), num_keys).unwrap();

        let handed: Vec<u32> = (0..before).filter_map(|_| vector.next().ok()).collect();
        drop(vector);

        let reloaded = StateVector::load(storage, session()).unwrap();
        prop_assert_eq!(reloaded.used_key_nums(), handed.clone());

        while let Ok(index) = reloaded.next() {
            prop_assert!(!handed.contains(&index));
        }
        prop_assert_eq!(reloaded.num_available(), 0);
    }

    /// INVARIANT: `next_with_reserve` never dips below the reserve.
    #[test]
    fn reserve_is_never_consumed(num_keys in 1u32..100, reserve in 0u32..20) {
        let vector = StateVector::new(MemoryStorage::new(), session(), num_keys).unwrap();

        while vector.next_with_reserve(reserve).is_ok() {}

        prop_assert_eq!(vector.num_available(), reserve.min(num_keys));
    }
}
