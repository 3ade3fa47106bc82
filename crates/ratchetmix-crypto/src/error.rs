//! Crypto error types.

use thiserror::Error;

/// Errors from cryptographic operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Authentication tag did not verify or the key was wrong.
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// What went wrong
        reason: String,
    },

    /// Encoded key material had the wrong length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Required length
        expected: usize,
        /// Length that was supplied
        actual: usize,
    },

    /// Message fingerprint does not match the key used to open it.
    #[error("fingerprint mismatch")]
    FingerprintMismatch,
}
