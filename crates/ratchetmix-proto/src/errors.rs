//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors from encoding and decoding wire types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// CBOR serialization failed
    #[error("CBOR encode error: {0}")]
    CborEncode(String),

    /// CBOR deserialization failed
    #[error("CBOR decode error: {0}")]
    CborDecode(String),

    /// Payload exceeds the maximum control payload size
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Actual size
        size: usize,
        /// Maximum allowed
        max: usize,
    },

    /// Message type code is not known
    #[error("unknown message type: {0:#06x}")]
    UnknownMessageType(u16),

    /// Message type carries no ratchet payload
    #[error("message type {0:?} has no control payload")]
    NotControlMessage(crate::MessageType),

    /// Identifier had the wrong length
    #[error("invalid identifier length: expected {expected}, got {actual}")]
    InvalidIdLength {
        /// Required length
        expected: usize,
        /// Length that was supplied
        actual: usize,
    },
}
