//! CBOR-encoded negotiation payloads.
//!
//! The payload type is determined by the [`MessageType`] of the carrying
//! message, so only the inner struct is serialized (no variant tag).
//!
//! # Security
//!
//! - Size Validation First: the size check happens BEFORE CBOR parsing so a
//!   hostile partner cannot make the parser chew on large inputs
//! - Fixed-size fields: session IDs and public keys are fixed arrays, so a
//!   decoded payload never carries a truncated identifier

use serde::{Deserialize, Serialize};

use crate::{
    MessageType, SessionId,
    errors::{ProtocolError, Result},
};

/// Upper bound on an encoded control payload.
pub const MAX_CONTROL_PAYLOAD_SIZE: usize = 4096;

/// Announcement of a new session.
///
/// `session_id` names the session the receiver should chain from (the
/// receiver's send session whose private key pairs with `public_key`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RekeyTrigger {
    /// Session the new one is derived from
    pub session_id: SessionId,
    /// Public key of the sender's new private key
    pub public_key: [u8; 32],
}

/// Acknowledgement that a session announced by a trigger now exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RekeyConfirm {
    /// ID of the newly created session
    pub session_id: SessionId,
}

/// Negotiation payloads owned by the ratchet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// New session announcement
    Trigger(RekeyTrigger),
    /// New session acknowledgement
    Confirm(RekeyConfirm),
}

impl Payload {
    /// Message type this payload travels as.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Trigger(_) => MessageType::KeyExchangeTrigger,
            Self::Confirm(_) => MessageType::KeyExchangeConfirm,
        }
    }

    /// Encode payload to CBOR.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(96);

        match self {
            Self::Trigger(inner) => ciborium::ser::into_writer(inner, &mut buf),
            Self::Confirm(inner) => ciborium::ser::into_writer(inner, &mut buf),
        }
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))?;

        Ok(buf)
    }

    /// Decode a payload carried by a message of type `message_type`.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTooLarge` if bytes exceed
    ///   `MAX_CONTROL_PAYLOAD_SIZE`
    /// - `ProtocolError::NotControlMessage` for non key-exchange types
    /// - `ProtocolError::CborDecode` if CBOR deserialization fails
    pub fn decode(message_type: MessageType, bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_CONTROL_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: bytes.len(),
                max: MAX_CONTROL_PAYLOAD_SIZE,
            });
        }

        let payload = match message_type {
            MessageType::KeyExchangeTrigger => Self::Trigger(
                ciborium::de::from_reader(bytes)
                    .map_err(|e| ProtocolError::CborDecode(e.to_string()))?,
            ),
            MessageType::KeyExchangeConfirm => Self::Confirm(
                ciborium::de::from_reader(bytes)
                    .map_err(|e| ProtocolError::CborDecode(e.to_string()))?,
            ),
            MessageType::Text => return Err(ProtocolError::NotControlMessage(message_type)),
        };

        Ok(payload)
    }
}
