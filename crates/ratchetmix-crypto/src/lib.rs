//! Ratchetmix Cryptographic Primitives
//!
//! Building blocks for the per-partner key pools. Pure functions with
//! deterministic outputs. Callers provide random bytes for deterministic
//! testing.
//!
//! # Key Lifecycle
//!
//! Every session in the ratchet is a single Diffie-Hellman step. The shared
//! secret is expanded into a base key, and every key in the session's pool is
//! derived from that base key and its index.
//!
//! ```text
//! my private key ──┐
//!                  ├─► X25519 ─► HKDF ─► Base Key ─┬─► SHA-256 ─► Session ID
//! partner public ──┘                               │
//!                                                  ├─► HKDF(index) ─► Symmetric Key
//!                                                  │
//!                                                  └─► HMAC(index) ─► Fingerprint
//! ```
//!
//! The receiver learns which key decrypts a message from the fingerprint on
//! the wire. The fingerprint reveals nothing about the symmetric key.
//!
//! # Security
//!
//! Single use:
//! - Each (base key, index) pair yields one symmetric key, used for exactly
//!   one message
//! - Symmetric keys are zeroized on drop
//!
//! Ratcheting:
//! - A rekey generates a fresh private key, so a new base key is
//!   independent of previous ones
//! - Compromising one session's base key does not expose other sessions

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod derivation;
mod dh;
mod encryption;
mod error;

pub use derivation::{
    BaseKey, Fingerprint, SymmetricKey, TtlParams, connection_fingerprint, derive_key,
    derive_key_fingerprint, generate_key_ttl, relationship_fingerprint, session_id,
};
pub use dh::{PRIVATE_KEY_SIZE, PrivateKey, PublicKey, session_base_key};
pub use encryption::{EncryptedMessage, NONCE_SIZE, decrypt, encrypt};
pub use error::CryptoError;
