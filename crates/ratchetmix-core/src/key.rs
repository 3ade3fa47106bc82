//! Handles to individual keys in a session's pool.

use std::sync::Arc;

use ratchetmix_crypto::{
    EncryptedMessage, Fingerprint, NONCE_SIZE, SymmetricKey, decrypt, derive_key,
    derive_key_fingerprint, encrypt,
};

use crate::{error::RatchetError, session::Session, storage::Storage};

/// Reference to the key at `index` in a session's pool.
///
/// Holds no secret material. The symmetric key is derived on demand and must
/// be discarded after a single encryption or decryption.
pub struct Key<S: Storage> {
    session: Arc<Session<S>>,
    index: u32,
}

impl<S: Storage> Key<S> {
    pub(crate) fn new(session: Arc<Session<S>>, index: u32) -> Self {
        Self { session, index }
    }

    /// Session this key belongs to.
    pub fn session(&self) -> &Arc<Session<S>> {
        &self.session
    }

    /// Position of the key in the session's pool.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Wire fingerprint identifying this key to the receiver.
    pub fn fingerprint(&self) -> Fingerprint {
        derive_key_fingerprint(self.session.base_key(), self.index)
    }

    /// Derive the single-use symmetric key.
    pub fn derive(&self) -> SymmetricKey {
        derive_key(self.session.base_key(), self.index)
    }

    /// Encrypt `plaintext` with this key.
    ///
    /// # Security
    ///
    /// Caller MUST provide cryptographically secure random bytes in
    /// production, and must not encrypt twice with the same key.
    pub fn encrypt(&self, plaintext: &[u8], nonce: [u8; NONCE_SIZE]) -> EncryptedMessage {
        encrypt(plaintext, &self.derive(), self.fingerprint(), nonce)
    }

    /// Decrypt a message addressed to this key.
    ///
    /// # Errors
    ///
    /// - `Crypto(FingerprintMismatch)` if the message names another key
    /// - `Crypto(DecryptionFailed)` if authentication fails
    pub fn decrypt(&self, message: &EncryptedMessage) -> Result<Vec<u8>, RatchetError> {
        if message.fingerprint != self.fingerprint() {
            return Err(ratchetmix_crypto::CryptoError::FingerprintMismatch.into());
        }
        Ok(decrypt(message, &self.derive())?)
    }

    /// Record that this key has been consumed.
    ///
    /// The only way a received key advances its session's state vector.
    pub fn denote_use(&self) -> Result<(), RatchetError> {
        self.session.use_key(self.index)
    }
}

impl<S: Storage> Clone for Key<S> {
    fn clone(&self) -> Self {
        Self { session: Arc::clone(&self.session), index: self.index }
    }
}

impl<S: Storage> std::fmt::Debug for Key<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Key").field("session", &self.session.id()).field("index", &self.index).finish()
    }
}
