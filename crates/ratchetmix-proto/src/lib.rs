//! Ratchetmix wire types.
//!
//! The ratchet owns exactly two wire formats: the `RekeyTrigger` announcing a
//! new session's public key, and the `RekeyConfirm` acknowledging it. Both
//! travel as end-to-end encrypted messages with a distinguished
//! [`MessageType`]. Everything else on the wire belongs to the transport.
//!
//! # Invariants
//!
//! - `SessionId` is always exactly 32 bytes
//! - Each payload variant maps to exactly one `MessageType`

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod errors;
pub mod ids;
pub mod message;
pub mod payloads;

pub use errors::{ProtocolError, Result};
pub use ids::{PartnerId, SessionId};
pub use message::{Encryption, MessageType};
pub use payloads::{Payload, RekeyConfirm, RekeyTrigger};
