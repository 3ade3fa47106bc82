//! Derivation of session identity, per-index keys, fingerprints and key
//! budgets from a session base key.
//!
//! # Security Properties
//!
//! - Key Uniqueness: each (base key, index) pair produces a unique key
//! - Fingerprint Separation: fingerprints use a different primitive (HMAC)
//!   and label than keys (HKDF), so one never reveals the other
//! - Determinism: both partners derive identical pools from the same base key

use std::fmt;

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

type HmacSha256 = Hmac<Sha256>;

/// Label for session ID hashing
const SESSION_ID_LABEL: &[u8] = b"ratchetmixSessionIdV1";

/// Label for per-index symmetric key derivation
const KEY_LABEL: &[u8] = b"ratchetmixKeyV1";

/// Label for per-index fingerprint derivation
const FINGERPRINT_LABEL: &[u8] = b"ratchetmixFingerprintV1";

/// Label for key budget sampling
const TTL_LABEL: &[u8] = b"ratchetmixTtlV1";

/// Label for relationship fingerprints
const RELATIONSHIP_LABEL: &[u8] = b"ratchetmixRelationshipV1";

/// Shared secret of one ratchet step.
///
/// Every key in a session's pool is derived from this value. Zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct BaseKey([u8; 32]);

impl BaseKey {
    /// Wrap raw base key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw base key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Drop for BaseKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for BaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BaseKey(..)")
    }
}

/// 32-byte single-use symmetric key for XChaCha20-Poly1305.
///
/// Zeroized on drop. Callers must not keep it past one encryption or
/// decryption.
pub struct SymmetricKey([u8; 32]);

impl SymmetricKey {
    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Wire identifier of a single key.
///
/// Sent in the clear next to the ciphertext so the receiver can find the
/// matching key without trial decryption.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Wrap raw fingerprint bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw fingerprint bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint(")?;
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

/// Parameters shaping the key budget of a session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TtlParams {
    /// Multiplier from ttl to pool size. The surplus is the rekey window.
    pub ttl_scalar: f64,
    /// Lower bound on the pool size.
    pub min_num_keys: u32,
}

/// Session identity: SHA-256 of the base key.
///
/// Both partners compute the same ID for mirrored send/receive sessions.
pub fn session_id(base_key: &BaseKey) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(SESSION_ID_LABEL);
    hasher.update(base_key.as_bytes());
    hasher.finalize().into()
}

/// Derive the symmetric key at `index` in a session's pool.
pub fn derive_key(base_key: &BaseKey, index: u32) -> SymmetricKey {
    let hkdf = Hkdf::<Sha256>::new(None, base_key.as_bytes());

    // Capacity: 15 (label) + 4 (index) = 19
    let mut info = Vec::with_capacity(KEY_LABEL.len() + 4);
    info.extend_from_slice(KEY_LABEL);
    info.extend_from_slice(&index.to_be_bytes());

    let mut key = [0u8; 32];
    let Ok(()) = hkdf.expand(&info, &mut key) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    SymmetricKey(key)
}

/// Derive the wire fingerprint of the key at `index`.
pub fn derive_key_fingerprint(base_key: &BaseKey, index: u32) -> Fingerprint {
    let Ok(mut mac) = HmacSha256::new_from_slice(base_key.as_bytes()) else {
        unreachable!("HMAC-SHA256 accepts any key size");
    };
    mac.update(FINGERPRINT_LABEL);
    mac.update(&index.to_be_bytes());
    let result = mac.finalize().into_bytes();

    let mut fingerprint = [0u8; 32];
    fingerprint.copy_from_slice(&result);
    Fingerprint(fingerprint)
}

/// Derive `(ttl, num_keys)` for a session from its base key.
///
/// `ttl` is sampled uniformly from `[min_keys, max_keys)` using base key
/// entropy, so both partners agree on it without communicating. `num_keys` is
/// `ceil(ttl * ttl_scalar)`, raised to `min_num_keys` and never below `ttl`.
///
/// # Invariants
///
/// - `min_keys <= ttl < max_keys` when `max_keys > min_keys`
/// - `ttl <= num_keys`
pub fn generate_key_ttl(
    base_key: &BaseKey,
    min_keys: u32,
    max_keys: u32,
    params: TtlParams,
) -> (u32, u32) {
    debug_assert!(max_keys >= min_keys);

    let mut hasher = Sha256::new();
    hasher.update(TTL_LABEL);
    hasher.update(base_key.as_bytes());
    let digest: [u8; 32] = hasher.finalize().into();

    let mut sample = [0u8; 8];
    sample.copy_from_slice(&digest[..8]);
    let sample = u64::from_be_bytes(sample);

    let range = u64::from(max_keys.saturating_sub(min_keys));
    let ttl = if range == 0 { min_keys } else { min_keys + (sample % range) as u32 };

    let scaled = (f64::from(ttl) * params.ttl_scalar).ceil();
    let scaled = if scaled >= f64::from(u32::MAX) { u32::MAX } else { scaled as u32 };
    let num_keys = scaled.max(params.min_num_keys).max(ttl);

    (ttl, num_keys)
}

/// Fingerprint binding one direction of a partnership to its origin keys.
///
/// The sender's send relationship and the receiver's receive relationship
/// produce the same value because both order inputs as (sender, receiver).
pub fn relationship_fingerprint(
    sender_public: &[u8; 32],
    receiver_public: &[u8; 32],
    sender_id: &[u8],
    receiver_id: &[u8],
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(RELATIONSHIP_LABEL);
    hasher.update(sender_public);
    hasher.update(receiver_public);
    hasher.update(sender_id);
    hasher.update(receiver_id);
    hasher.finalize().into()
}

/// Order-independent fingerprint of both directions of a partnership.
///
/// Inputs are sorted before hashing, so both partners compute the same value
/// from their (send, receive) pairs.
pub fn connection_fingerprint(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(low);
    hasher.update(high);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn ttl_params() -> TtlParams {
        TtlParams { ttl_scalar: 1.2, min_num_keys: 224 }
    }

    #[test]
    fn key_derivation_is_deterministic() {
        let base = BaseKey::from_bytes([7u8; 32]);

        let a = derive_key(&base, 3);
        let b = derive_key(&base, 3);

        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn different_indices_produce_different_keys() {
        let base = BaseKey::from_bytes([7u8; 32]);

        assert_ne!(derive_key(&base, 0).as_bytes(), derive_key(&base, 1).as_bytes());
        assert_ne!(derive_key_fingerprint(&base, 0), derive_key_fingerprint(&base, 1));
    }

    #[test]
    fn fingerprint_differs_from_key() {
        let base = BaseKey::from_bytes([1u8; 32]);

        let key = derive_key(&base, 9);
        let fingerprint = derive_key_fingerprint(&base, 9);

        assert_ne!(key.as_bytes(), fingerprint.as_bytes());
    }

    #[test]
    fn session_id_depends_on_base_key() {
        let a = session_id(&BaseKey::from_bytes([1u8; 32]));
        let b = session_id(&BaseKey::from_bytes([2u8; 32]));

        assert_ne!(a, b);
    }

    #[test]
    fn degenerate_range_uses_min_keys() {
        let base = BaseKey::from_bytes([3u8; 32]);

        let (ttl, num_keys) = generate_key_ttl(&base, 100, 100, ttl_params());

        assert_eq!(ttl, 100);
        assert_eq!(num_keys, 224);
    }

    #[test]
    fn connection_fingerprint_is_order_independent() {
        let a = [1u8; 32];
        let b = [2u8; 32];

        assert_eq!(connection_fingerprint(&a, &b), connection_fingerprint(&b, &a));
    }

    #[test]
    fn relationship_fingerprint_is_directional() {
        let alice = [1u8; 32];
        let bob = [2u8; 32];

        let alice_to_bob = relationship_fingerprint(&alice, &bob, b"alice", b"bob");
        let bob_to_alice = relationship_fingerprint(&bob, &alice, b"bob", b"alice");

        assert_ne!(alice_to_bob, bob_to_alice);
    }

    proptest! {
        #[test]
        fn ttl_stays_in_bounds(
            seed in any::<[u8; 32]>(),
            min_keys in 10u32..1000,
            extra in 1u32..1000,
        ) {
            let base = BaseKey::from_bytes(seed);
            let max_keys = min_keys + extra;

            let (ttl, num_keys) = generate_key_ttl(&base, min_keys, max_keys, ttl_params());

            prop_assert!(ttl >= min_keys);
            prop_assert!(ttl < max_keys);
            prop_assert!(num_keys >= ttl);
            prop_assert!(num_keys >= 224);
        }
    }
}
