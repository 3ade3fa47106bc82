//! X25519 key agreement producing session base keys.
//!
//! All functions are pure. Private key generation takes caller-supplied random
//! bytes so simulations stay reproducible.

use std::fmt;

use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::StaticSecret;
use zeroize::Zeroizing;

use crate::{derivation::BaseKey, error::CryptoError};

/// Encoded size of private and public keys.
pub const PRIVATE_KEY_SIZE: usize = 32;

/// Label for expanding the DH output into a base key
const BASE_KEY_LABEL: &[u8] = b"ratchetmixBaseKeyV1";

/// X25519 private key. Zeroized on drop.
#[derive(Clone)]
pub struct PrivateKey(StaticSecret);

impl PrivateKey {
    /// Build a private key from 32 random bytes.
    ///
    /// # Security
    ///
    /// Caller MUST provide cryptographically secure random bytes in
    /// production. Clamping is applied by X25519 itself.
    pub fn from_random_bytes(bytes: [u8; PRIVATE_KEY_SIZE]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    /// Decode a private key previously produced by [`Self::to_bytes`].
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw: [u8; PRIVATE_KEY_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKeyLength { expected: PRIVATE_KEY_SIZE, actual: bytes.len() }
        })?;
        Ok(Self::from_random_bytes(raw))
    }

    /// Public key matching this private key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(x25519_dalek::PublicKey::from(&self.0).to_bytes())
    }

    /// Encoded private key for persistence.
    pub fn to_bytes(&self) -> Zeroizing<[u8; PRIVATE_KEY_SIZE]> {
        Zeroizing::new(self.0.to_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

/// X25519 public key, the group-element encoding carried in rekey triggers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; PRIVATE_KEY_SIZE]);

impl PublicKey {
    /// Wrap raw public key bytes.
    pub fn from_bytes(bytes: [u8; PRIVATE_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Decode a public key, checking its length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw: [u8; PRIVATE_KEY_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKeyLength { expected: PRIVATE_KEY_SIZE, actual: bytes.len() }
        })?;
        Ok(Self(raw))
    }

    /// Raw public key bytes.
    pub fn as_bytes(&self) -> &[u8; PRIVATE_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey(")?;
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

/// Compute the base key shared by `my_private` and `partner_public`.
///
/// `DH(a, B) == DH(b, A)`, so mirrored sessions on both partners derive the
/// same base key and therefore the same session ID and key pool. The
/// `relationship` fingerprint salts the expansion: the two directions of a
/// partnership use the same DH pair at bootstrap but must never share keys.
pub fn session_base_key(
    my_private: &PrivateKey,
    partner_public: &PublicKey,
    relationship: &[u8; 32],
) -> BaseKey {
    let shared = my_private.0.diffie_hellman(&x25519_dalek::PublicKey::from(partner_public.0));

    let hkdf = Hkdf::<Sha256>::new(Some(relationship), shared.as_bytes());
    let mut key = [0u8; 32];
    let Ok(()) = hkdf.expand(BASE_KEY_LABEL, &mut key) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    BaseKey::from_bytes(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_key_is_symmetric() {
        let alice = PrivateKey::from_random_bytes([1u8; 32]);
        let bob = PrivateKey::from_random_bytes([2u8; 32]);

        let from_alice = session_base_key(&alice, &bob.public_key(), &[7; 32]);
        let from_bob = session_base_key(&bob, &alice.public_key(), &[7; 32]);

        assert_eq!(from_alice, from_bob);
    }

    #[test]
    fn directions_do_not_share_base_keys() {
        let alice = PrivateKey::from_random_bytes([1u8; 32]);
        let bob = PrivateKey::from_random_bytes([2u8; 32]);

        assert_ne!(
            session_base_key(&alice, &bob.public_key(), &[1; 32]),
            session_base_key(&alice, &bob.public_key(), &[2; 32])
        );
    }

    #[test]
    fn different_partners_produce_different_base_keys() {
        let alice = PrivateKey::from_random_bytes([1u8; 32]);
        let bob = PrivateKey::from_random_bytes([2u8; 32]);
        let carol = PrivateKey::from_random_bytes([3u8; 32]);

        assert_ne!(
            session_base_key(&alice, &bob.public_key(), &[0; 32]),
            session_base_key(&alice, &carol.public_key(), &[0; 32])
        );
    }

    #[test]
    fn private_key_survives_encoding() {
        let key = PrivateKey::from_random_bytes([9u8; 32]);

        let decoded = PrivateKey::from_slice(key.to_bytes().as_slice()).unwrap();

        assert_eq!(decoded.public_key(), key.public_key());
    }

    #[test]
    fn wrong_length_is_rejected() {
        let result = PublicKey::from_slice(&[0u8; 31]);

        assert_eq!(result, Err(CryptoError::InvalidKeyLength { expected: 32, actual: 31 }));
    }

    #[test]
    fn debug_does_not_leak_private_key() {
        let key = PrivateKey::from_random_bytes([0xAB; 32]);

        assert_eq!(format!("{key:?}"), "PrivateKey(..)");
    }
}
