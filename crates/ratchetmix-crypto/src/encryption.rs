//! Single-use message encryption using `XChaCha20-Poly1305`
//!
//! All functions are pure - random bytes must be provided by the caller.
//! The key fingerprint is bound as associated data so a ciphertext cannot be
//! replayed under a different fingerprint.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};

use crate::{
    derivation::{Fingerprint, SymmetricKey},
    error::CryptoError,
};

/// Size of the `XChaCha20` nonce (24 bytes)
pub const NONCE_SIZE: usize = 24;

/// Poly1305 tag size (16 bytes)
const POLY1305_TAG_SIZE: usize = 16;

/// An encrypted message with the fingerprint identifying its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedMessage {
    /// Fingerprint of the key used, sent in the clear
    pub fingerprint: Fingerprint,
    /// The 24-byte `XChaCha20` nonce
    pub nonce: [u8; NONCE_SIZE],
    /// The ciphertext including 16-byte Poly1305 tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedMessage {
    /// Plaintext length (ciphertext length minus authentication tag).
    pub fn plaintext_len(&self) -> usize {
        self.ciphertext.len().saturating_sub(POLY1305_TAG_SIZE)
    }
}

/// Encrypt `plaintext` under a single-use key.
///
/// # Security
///
/// - Keys are single use, so the random nonce only guards against misuse
/// - Caller MUST provide cryptographically secure random bytes in production
pub fn encrypt(
    plaintext: &[u8],
    key: &SymmetricKey,
    fingerprint: Fingerprint,
    nonce: [u8; NONCE_SIZE],
) -> EncryptedMessage {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let payload = Payload { msg: plaintext, aad: fingerprint.as_bytes() };

    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(&nonce), payload) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    EncryptedMessage { fingerprint, nonce, ciphertext }
}

/// Decrypt a message with the key its fingerprint resolved to.
///
/// # Errors
///
/// - `DecryptionFailed`: authentication tag or key is incorrect (tamper)
pub fn decrypt(encrypted: &EncryptedMessage, key: &SymmetricKey) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let payload =
        Payload { msg: encrypted.ciphertext.as_slice(), aad: encrypted.fingerprint.as_bytes() };

    cipher.decrypt(XNonce::from_slice(&encrypted.nonce), payload).map_err(|_| {
        CryptoError::DecryptionFailed { reason: "authentication failed".to_string() }
    })
}
