//! Fuzz target for `StateVector` under storage failures.
//!
//! # Invariants
//!
//! - No index is ever handed out twice
//! - A failed write leaves memory unchanged
//! - Memory and storage agree after every operation
//! - `next_with_reserve` never consumes the rekey reserve

#![no_main]

use std::collections::HashSet;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use ratchetmix_core::{ChaoticStorage, MemoryStorage, StateVector};
use ratchetmix_proto::SessionId;

#[derive(Debug, Arbitrary)]
struct Scenario {
    num_keys: u8,
    reserve: u8,
    chaos_seed: u64,
    /// 0-9 maps to 0%-90%
    failure_rate_tenth: u8,
    operations: Vec<Operation>,
}

#[derive(Debug, Arbitrary)]
enum Operation {
    Next,
    NextWithReserve,
    MarkUsed(u8),
    Reload,
}

fuzz_target!(|scenario: Scenario| {
    let num_keys = u32::from(scenario.num_keys.max(1));
    let reserve = u32::from(scenario.reserve) % (num_keys + 1);
    let session = SessionId::from_bytes([0x5A; 32]);

    let disk = MemoryStorage::new();
    if StateVector::new(disk.clone(), session, num_keys).is_err() {
        return;
    }
    let chaos = ChaoticStorage::with_seed(
        disk.clone(),
        f64::from(scenario.failure_rate_tenth % 10) / 10.0,
        scenario.chaos_seed,
    );
    let Ok(mut vector) = StateVector::load(chaos.clone(), session) else {
        return;
    };

    let mut handed = HashSet::new();
    for operation in scenario.operations.iter().take(256) {
        let before = vector.unused_key_nums();
        let outcome = match operation {
            Operation::Next => vector.next().map(Some),
            Operation::NextWithReserve => {
                let result = vector.next_with_reserve(reserve).map(Some);
                if result.is_ok() {
                    assert!(before.len() as u32 > reserve, "reserve consumed");
                }
                result
            },
            Operation::MarkUsed(index) => {
                let index = u32::from(*index);
                vector.mark_used(index).map(|()| (index < num_keys).then_some(index))
            },
            Operation::Reload => {
                if let Ok(reloaded) = StateVector::load(chaos.clone(), session) {
                    vector = reloaded;
                }
                Ok(None)
            },
        };

        match outcome {
            Ok(Some(index)) if !matches!(operation, Operation::MarkUsed(_)) => {
                assert!(handed.insert(index), "index {index} handed out twice");
            },
            Ok(Some(index)) => {
                handed.insert(index);
            },
            Ok(None) => {},
            Err(_) => assert_eq!(vector.unused_key_nums(), before),
        }

        let on_disk = StateVector::load(disk.clone(), session).expect("storage must hold a vector");
        assert_eq!(on_disk.unused_key_nums(), vector.unused_key_nums());
    }
});
