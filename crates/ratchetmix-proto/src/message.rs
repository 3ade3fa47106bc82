//! Message classification shared with the transport.

use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;

/// Type of a message carried by the transport.
///
/// Control messages of the ratchet are routed to the key exchange by type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum MessageType {
    /// Application text, opaque to the ratchet
    Text = 0x0001,
    /// Announcement of a new session's public key
    KeyExchangeTrigger = 0x0010,
    /// Acknowledgement that the announced session was created
    KeyExchangeConfirm = 0x0011,
}

impl MessageType {
    /// Wire code of this message type.
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// True for the ratchet's own control messages.
    pub fn is_key_exchange(self) -> bool {
        matches!(self, Self::KeyExchangeTrigger | Self::KeyExchangeConfirm)
    }
}

impl TryFrom<u16> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(Self::Text),
            0x0010 => Ok(Self::KeyExchangeTrigger),
            0x0011 => Ok(Self::KeyExchangeConfirm),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// How a message was protected in transit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encryption {
    /// Encrypted with a key from a partner session
    E2E,
    /// Sent without end-to-end encryption
    Unencrypted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_roundtrip() {
        for ty in
            [MessageType::Text, MessageType::KeyExchangeTrigger, MessageType::KeyExchangeConfirm]
        {
            assert_eq!(MessageType::try_from(ty.to_u16()), Ok(ty));
        }
    }

    #[test]
    fn unknown_code_is_rejected() {
        assert_eq!(MessageType::try_from(0xBEEF), Err(ProtocolError::UnknownMessageType(0xBEEF)));
    }
}
