//! Error types for the ratchet core.
//!
//! Errors fall into four classes, and callers branch on the class rather than
//! the variant:
//!
//! - Exhaustion (`KeysExhausted`, `ReservedForRekey`, `NoSendableSession`):
//!   steady-state signals that a rekey is due. Not faults.
//! - Protocol (`UnknownSession`, `UnknownPartner`, `UnknownFingerprint`,
//!   `BadTrigger`, `IllegalTransition`, ...): log and drop the offending
//!   message. These arise from normal races such as retransmission.
//! - Persistence: unrecoverable. Continuing with state that is not on disk
//!   risks handing out a key index twice after a restart.
//! - Configuration and crypto errors from bad inputs.

use ratchetmix_crypto::CryptoError;
use ratchetmix_proto::{PartnerId, SessionId};
use thiserror::Error;

use crate::{session::NegotiationStatus, storage::StorageError};

/// Errors from session, relationship, manager and store operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RatchetError {
    /// Every key in the session's pool has been used
    #[error("session {session} has no keys left")]
    KeysExhausted {
        /// Session that ran out
        session: SessionId,
    },

    /// Remaining keys are reserved for rekey traffic
    #[error("session {session} has {available} keys left, all reserved for rekey ({reserved})")]
    ReservedForRekey {
        /// Session whose ordinary keys are used up
        session: SessionId,
        /// Keys still available
        available: u32,
        /// Size of the rekey reserve
        reserved: u32,
    },

    /// No session in the send relationship can hand out a key
    #[error("no sendable session for partner {0}")]
    NoSendableSession(PartnerId),

    /// Session ID is not known to the relationship or manager
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    /// Partner is not in the store
    #[error("unknown partner {0}")]
    UnknownPartner(PartnerId),

    /// Partner is already in the store
    #[error("partner {0} already exists")]
    PartnerExists(PartnerId),

    /// Wire fingerprint matches no unused receive key
    #[error("unknown key fingerprint")]
    UnknownFingerprint,

    /// Rekey trigger failed validation
    #[error("bad rekey trigger: {0}")]
    BadTrigger(String),

    /// Negotiation status change not permitted from the current state
    #[error("illegal negotiation transition for session {session}: {from:?} -> {to:?}")]
    IllegalTransition {
        /// Session being updated
        session: SessionId,
        /// Current status
        from: NegotiationStatus,
        /// Requested status
        to: NegotiationStatus,
    },

    /// Session parameters are unusable
    #[error("invalid session parameters: {0}")]
    InvalidParams(String),

    /// Reading or writing persisted state failed
    #[error("persistence failure for {key}: {source}")]
    Persistence {
        /// Storage key of the affected object
        key: String,
        /// Underlying storage error
        #[source]
        source: StorageError,
    },

    /// Key material could not be decoded or a message failed to open
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl RatchetError {
    /// Wrap a storage failure for `key`.
    pub fn persistence(key: impl Into<String>, source: StorageError) -> Self {
        Self::Persistence { key: key.into(), source }
    }

    /// Returns true if this error means the key pool needs a rekey.
    ///
    /// Callers treat these as "rekey now" signals, never as faults.
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            Self::KeysExhausted { .. } | Self::ReservedForRekey { .. } | Self::NoSendableSession(_)
        )
    }

    /// Returns true if the offending message should be logged and dropped.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::UnknownSession(_)
                | Self::UnknownPartner(_)
                | Self::PartnerExists(_)
                | Self::UnknownFingerprint
                | Self::BadTrigger(_)
                | Self::IllegalTransition { .. }
        )
    }

    /// Returns true if the caller must stop using the affected state.
    ///
    /// Persistence failures are fatal: in-memory key usage that is not on
    /// disk could be handed out again after a restart. Callers shut down in
    /// a controlled way instead of continuing.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Persistence { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionId {
        SessionId::from_bytes([1; 32])
    }

    #[test]
    fn exhaustion_errors_are_not_fatal() {
        let errors = [
            RatchetError::KeysExhausted { session: session() },
            RatchetError::ReservedForRekey { session: session(), available: 5, reserved: 5 },
            RatchetError::NoSendableSession(PartnerId::from_bytes([2; 32])),
        ];

        for error in errors {
            assert!(error.is_exhaustion(), "{error}");
            assert!(!error.is_fatal(), "{error}");
            assert!(!error.is_protocol(), "{error}");
        }
    }

    #[test]
    fn protocol_errors_are_dropped_not_fatal() {
        let errors = [
            RatchetError::UnknownSession(session()),
            RatchetError::UnknownFingerprint,
            RatchetError::BadTrigger("not e2e".to_string()),
        ];

        for error in errors {
            assert!(error.is_protocol(), "{error}");
            assert!(!error.is_fatal(), "{error}");
        }
    }

    #[test]
    fn persistence_errors_are_fatal() {
        let error = RatchetError::persistence(
            "session/ab/state_vector",
            StorageError::Io("disk full".to_string()),
        );

        assert!(error.is_fatal());
        assert!(!error.is_exhaustion());
        assert!(error.to_string().contains("disk full"));
    }
}
