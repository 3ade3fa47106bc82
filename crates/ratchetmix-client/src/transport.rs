//! Collaborators the key exchange runs over.
//!
//! The network, the critical-message buffer and the garbled-message buffer
//! belong to the surrounding client. This module defines only the narrow
//! interfaces the protocol consumes, plus the message types that cross them.

use std::{future::Future, time::Duration};

use ratchetmix_crypto::EncryptedMessage;
use ratchetmix_proto::{Encryption, MessageType, PartnerId};

use crate::error::TransportError;

/// Network round that carried part of a message.
pub type RoundId = u64;

/// Body of a message on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Sealed with a single-use session key
    E2E(EncryptedMessage),
    /// Sent in the clear
    Plain(Vec<u8>),
}

/// A message as handed to and received from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Sending client
    pub sender: PartnerId,
    /// Receiving client
    pub recipient: PartnerId,
    /// Routing type
    pub message_type: MessageType,
    /// Protected or plain contents
    pub body: Body,
}

impl Envelope {
    /// How the body is protected.
    pub fn encryption(&self) -> Encryption {
        match self.body {
            Body::E2E(_) => Encryption::E2E,
            Body::Plain(_) => Encryption::Unencrypted,
        }
    }
}

/// An opened message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Sending client
    pub sender: PartnerId,
    /// Routing type
    pub message_type: MessageType,
    /// How the message was protected in transit
    pub encryption: Encryption,
    /// Decrypted contents
    pub payload: Vec<u8>,
}

/// Outcome of handing a message to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    /// Rounds the message was sent on
    pub rounds: Vec<RoundId>,
    /// Transport-assigned message identifier
    pub message_id: [u8; 32],
    /// Send time, Unix seconds
    pub timestamp_secs: u64,
}

/// End-to-end message transport.
pub trait Transport: Clone + Send + Sync + 'static {
    /// Hand `envelope` to the network.
    fn send_e2e(
        &self,
        envelope: Envelope,
    ) -> impl Future<Output = Result<SendReport, TransportError>> + Send;

    /// Wait until every round in `rounds` completes.
    ///
    /// Returns `Ok(true)` if all succeeded, `Ok(false)` if any failed and
    /// `Err` if the wait could not be performed. The caller bounds the wait
    /// with `timeout`.
    fn wait_for_rounds(
        &self,
        rounds: &[RoundId],
        timeout: Duration,
    ) -> impl Future<Output = Result<bool, TransportError>> + Send;
}

/// Buffer of messages that must be retried until delivery is known.
pub trait CriticalMessages: Send + Sync + 'static {
    /// `envelope` is about to be sent.
    fn add_processing(&self, envelope: &Envelope);

    /// `envelope` was delivered.
    fn succeeded(&self, envelope: &Envelope);

    /// `envelope` failed and must be retried later.
    fn failed(&self, envelope: &Envelope);
}

/// Buffer of incoming messages no known key could open.
pub trait GarbledMessages: Send + Sync + 'static {
    /// Keep `envelope` for a later retry.
    fn add(&self, envelope: Envelope);

    /// New receive keys exist; retry the buffered messages.
    fn check_garbled_messages(&self);
}
