//! Key usage tracking for one session's pool.
//!
//! A [`StateVector`] records which key indices of a fixed-size pool have been
//! consumed. It is the only authority on key index uniqueness: two callers
//! never receive the same index from [`StateVector::next`], including across
//! a crash and restart.
//!
//! # Invariants
//!
//! - A bit is set iff that key index has been irrevocably consumed
//! - `num_available == num_keys - popcount(bits)`
//! - `first_available` is the lowest unused index at or after its previous
//!   value. It never rewinds
//! - Every mutation is on disk before it becomes observable

#![allow(clippy::disallowed_types, reason = "Synchronous locking operations only")]
#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::sync::Mutex;

use ratchetmix_proto::SessionId;
use serde::{Deserialize, Serialize};

use crate::{
    error::RatchetError,
    storage::{Storage, load_cbor, save_cbor},
};

/// Storage format version for state vectors.
const STATE_VECTOR_VERSION: u64 = 0;

const WORD_BITS: u32 = 64;

/// Fixed-size set of key indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBitSet {
    words: Vec<u64>,
    len: u32,
}

impl KeyBitSet {
    /// Create a set over `[0, len)` with every bit clear.
    pub fn new(len: u32) -> Self {
        let words = len.div_ceil(WORD_BITS) as usize;
        Self { words: vec![0; words], len }
    }

    /// Number of indices covered.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// True if the set covers no indices.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `index` is set. Out-of-range indices read as unset.
    pub fn get(&self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        let (word, bit) = Self::locate(index);
        self.words[word] & (1 << bit) != 0
    }

    /// Set `index`. Returns true if the bit was previously clear.
    ///
    /// Out-of-range indices are ignored and return false.
    pub fn set(&mut self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        let (word, bit) = Self::locate(index);
        let was_clear = self.words[word] & (1 << bit) == 0;
        self.words[word] |= 1 << bit;
        was_clear
    }

    /// Lowest clear index at or after `from`, if any.
    pub fn next_unset(&self, from: u32) -> Option<u32> {
        if from >= self.len {
            return None;
        }

        let (mut word, bit) = Self::locate(from);
        // Ignore bits below `from` in the first word
        let mut free = !self.words[word] & (u64::MAX << bit);

        loop {
            if free != 0 {
                let index = word as u32 * WORD_BITS + free.trailing_zeros();
                return (index < self.len).then_some(index);
            }
            word += 1;
            if word >= self.words.len() {
                return None;
            }
            free = !self.words[word];
        }
    }

    /// Number of set indices.
    pub fn count_set(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    /// Iterate over set indices in increasing order.
    pub fn iter_set(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(|&i| self.get(i))
    }

    /// Iterate over clear indices in increasing order.
    pub fn iter_unset(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(|&i| !self.get(i))
    }

    fn locate(index: u32) -> (usize, u32) {
        ((index / WORD_BITS) as usize, index % WORD_BITS)
    }
}

/// Persisted state of a [`StateVector`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct VectorState {
    bits: KeyBitSet,
    first_available: u32,
    num_available: u32,
}

/// Tracker of used keys in one session's pool.
///
/// All mutations are serialized by a single lock and persisted while it is
/// held, so concurrent senders block rather than race.
pub struct StateVector<S: Storage> {
    session: SessionId,
    storage: S,
    state: Mutex<VectorState>,
}

impl<S: Storage> StateVector<S> {
    /// Create a fresh vector with `num_keys` unused keys and persist it.
    pub fn new(storage: S, session: SessionId, num_keys: u32) -> Result<Self, RatchetError> {
        let state = VectorState {
            bits: KeyBitSet::new(num_keys),
            first_available: 0,
            num_available: num_keys,
        };

        let vector = Self { session, storage, state: Mutex::new(state) };
        {
            let state = vector.state.lock().expect("state vector mutex poisoned");
            vector.save(&state)?;
        }

        Ok(vector)
    }

    /// Load a persisted vector.
    pub fn load(storage: S, session: SessionId) -> Result<Self, RatchetError> {
        let key = Self::storage_key(&session);
        let state: VectorState = load_cbor(&storage, &key, STATE_VECTOR_VERSION)
            .map_err(|e| RatchetError::persistence(key, e))?;

        Ok(Self { session, storage, state: Mutex::new(state) })
    }

    /// Storage key for the vector of `session`.
    pub fn storage_key(session: &SessionId) -> String {
        format!("session/{}/state_vector", session.to_hex())
    }

    /// Reserve the lowest unused key index.
    ///
    /// The index is on disk as used before it is returned.
    ///
    /// # Errors
    ///
    /// - `KeysExhausted` when every index has been handed out
    /// - `Persistence` if the write fails. The reservation is rolled back.
    pub fn next(&self) -> Result<u32, RatchetError> {
        self.next_with_reserve(0)
    }

    /// Reserve the lowest unused key index unless only `reserve` keys remain.
    ///
    /// The reserve check and the reservation happen under one lock, so
    /// concurrent callers can never dip into the reserve.
    ///
    /// # Errors
    ///
    /// - `KeysExhausted` when every index has been handed out
    /// - `ReservedForRekey` when `num_available <= reserve`
    /// - `Persistence` if the write fails. The reservation is rolled back.
    pub fn next_with_reserve(&self, reserve: u32) -> Result<u32, RatchetError> {
        let mut state = self.state.lock().expect("state vector mutex poisoned");

        if state.first_available >= state.bits.len() {
            return Err(RatchetError::KeysExhausted { session: self.session });
        }
        if state.num_available <= reserve {
            return Err(RatchetError::ReservedForRekey {
                session: self.session,
                available: state.num_available,
                reserved: reserve,
            });
        }

        let mut updated = state.clone();
        let index = updated.first_available;
        updated.bits.set(index);
        updated.num_available -= 1;
        updated.first_available = updated.bits.next_unset(index).unwrap_or(updated.bits.len());

        self.save(&updated)?;
        *state = updated;

        debug_assert_eq!(state.num_available, state.bits.len() - state.bits.count_set());
        Ok(index)
    }

    /// Mark an arbitrary key index used.
    ///
    /// Idempotent: marking an already used index changes nothing and writes
    /// nothing. Indices outside the pool are ignored.
    pub fn mark_used(&self, index: u32) -> Result<(), RatchetError> {
        let mut state = self.state.lock().expect("state vector mutex poisoned");

        if index >= state.bits.len() || state.bits.get(index) {
            return Ok(());
        }

        let mut updated = state.clone();
        updated.bits.set(index);
        updated.num_available -= 1;
        if index == updated.first_available {
            updated.first_available =
                updated.bits.next_unset(index).unwrap_or(updated.bits.len());
        }

        self.save(&updated)?;
        *state = updated;

        Ok(())
    }

    /// Whether `index` has been consumed.
    pub fn is_used(&self, index: u32) -> bool {
        self.state.lock().expect("state vector mutex poisoned").bits.get(index)
    }

    /// Keys not yet consumed.
    pub fn num_available(&self) -> u32 {
        self.state.lock().expect("state vector mutex poisoned").num_available
    }

    /// Size of the pool.
    pub fn num_keys(&self) -> u32 {
        self.state.lock().expect("state vector mutex poisoned").bits.len()
    }

    /// Index the next call to [`Self::next`] will return.
    pub fn first_available(&self) -> u32 {
        self.state.lock().expect("state vector mutex poisoned").first_available
    }

    /// All unused indices, increasing.
    pub fn unused_key_nums(&self) -> Vec<u32> {
        self.state.lock().expect("state vector mutex poisoned").bits.iter_unset().collect()
    }

    /// All used indices, increasing.
    pub fn used_key_nums(&self) -> Vec<u32> {
        self.state.lock().expect("state vector mutex poisoned").bits.iter_set().collect()
    }

    /// Remove the persisted vector.
    pub fn delete(&self) -> Result<(), RatchetError> {
        let key = Self::storage_key(&self.session);
        self.storage
            .delete(&key, STATE_VECTOR_VERSION)
            .map_err(|e| RatchetError::persistence(key, e))
    }

    fn save(&self, state: &VectorState) -> Result<(), RatchetError> {
        let key = Self::storage_key(&self.session);
        save_cbor(&self.storage, &key, STATE_VECTOR_VERSION, state).map_err(|e| {
            tracing::error!(session = %self.session, error = %e, "state vector write failed");
            RatchetError::persistence(key, e)
        })
    }
}

impl<S: Storage> std::fmt::Debug for StateVector<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("state vector mutex poisoned");
        f.debug_struct("StateVector")
            .field("session", &self.session)
            .field("num_keys", &state.bits.len())
            .field("num_available", &state.num_available)
            .field("first_available", &state.first_available)
            .finish()
    }
}
