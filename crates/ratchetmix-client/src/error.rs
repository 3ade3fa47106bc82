//! Error types for the key-exchange protocol.

use std::time::Duration;

use ratchetmix_core::RatchetError;
use ratchetmix_proto::ProtocolError;
use thiserror::Error;

/// Failure of the transport collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The message could not be handed to the network
    #[error("send failed: {0}")]
    Send(String),

    /// The transport has shut down
    #[error("transport closed")]
    Closed,
}

/// Errors from sending, receiving and negotiating.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExchangeError {
    /// Ratchet state rejected the operation
    #[error(transparent)]
    Ratchet(#[from] RatchetError),

    /// Control payload could not be encoded or decoded
    #[error("control payload: {0}")]
    Payload(#[from] ProtocolError),

    /// Transport refused the message
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// Rounds carrying the message did not complete in time
    #[error("delivery not confirmed within {0:?}")]
    Timeout(Duration),

    /// Rounds carrying the message completed unsuccessfully
    #[error("delivery failed")]
    DeliveryFailed,
}

impl ExchangeError {
    /// Returns true if the caller must stop: ratchet state could not be
    /// persisted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Ratchet(e) if e.is_fatal())
    }

    /// Returns true if the message was dropped for a protocol reason and
    /// nothing else needs to happen.
    pub fn is_protocol(&self) -> bool {
        match self {
            Self::Ratchet(e) => e.is_protocol(),
            Self::Payload(_) => true,
            Self::Transport(_) | Self::Timeout(_) | Self::DeliveryFailed => false,
        }
    }

    /// Returns true if the negotiation should simply be retried later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Ratchet(e) => e.is_exhaustion(),
            Self::Transport(_) | Self::Timeout(_) | Self::DeliveryFailed => true,
            Self::Payload(_) => false,
        }
    }
}
