//! Receiver side of the key exchange, and confirm handling on the sender.

use std::{sync::Arc, time::Duration};

use ratchetmix_core::{Environment, RatchetError, Session, Storage, Store};
use ratchetmix_crypto::PublicKey;
use ratchetmix_proto::{Encryption, MessageType, Payload, RekeyConfirm};

use crate::{
    error::ExchangeError,
    messages::seal,
    transport::{CriticalMessages, GarbledMessages, ReceivedMessage, Transport},
    trigger::wait_for_delivery,
};

/// Handle a `RekeyTrigger` from a partner.
///
/// Creates the receive session chained from the send session the trigger
/// names, then answers with a `RekeyConfirm` tracked by `critical`. A
/// retransmitted trigger finds the session already present and is answered
/// again without other side effects.
///
/// # Errors
///
/// - `BadTrigger` if the trigger was not end-to-end encrypted or is not a
///   trigger payload
/// - `UnknownPartner` if the sender is not a partner
/// - `UnknownSession` if the named session does not exist. No confirm is
///   sent.
/// - `Transport`, `Timeout` or `DeliveryFailed` if the confirm was not
///   delivered. The session exists and `critical` retries the confirm.
pub async fn handle_trigger<S: Storage, E: Environment, T: Transport>(
    store: &Store<S, E>,
    transport: &T,
    critical: &dyn CriticalMessages,
    garbled: &dyn GarbledMessages,
    message: &ReceivedMessage,
    round_timeout: Duration,
) -> Result<Arc<Session<S>>, ExchangeError> {
    if message.encryption != Encryption::E2E {
        return Err(RatchetError::BadTrigger("trigger was not end-to-end encrypted".to_string())
            .into());
    }

    let manager = store.get_partner(&message.sender)?;

    let Payload::Trigger(trigger) = Payload::decode(message.message_type, &message.payload)? else {
        return Err(RatchetError::BadTrigger("payload is not a rekey trigger".to_string()).into());
    };

    let source = manager
        .get_send_session(&trigger.session_id)
        .ok_or(RatchetError::UnknownSession(trigger.session_id))?;

    let (session, duplicate) = manager.new_receive_session(
        PublicKey::from_bytes(trigger.public_key),
        manager.receive_params(),
        &source,
        store.env(),
    )?;

    if duplicate {
        tracing::debug!(
            partner = %message.sender,
            session = %session.id(),
            "retransmitted trigger, confirming again"
        );
    } else {
        garbled.check_garbled_messages();
    }

    let payload = Payload::Confirm(RekeyConfirm { session_id: session.id() }).encode()?;
    let key = match manager.pop_send_key() {
        Err(e) if e.is_exhaustion() => manager.pop_rekey_key()?,
        result => result?,
    };
    let envelope = seal(
        store.env(),
        store.my_id(),
        message.sender,
        MessageType::KeyExchangeConfirm,
        &key,
        &payload,
    );

    critical.add_processing(&envelope);
    let delivered = match transport.send_e2e(envelope.clone()).await {
        Ok(report) => wait_for_delivery(transport, &report, round_timeout).await,
        Err(e) => Err(e.into()),
    };

    match delivered {
        Ok(()) => {
            critical.succeeded(&envelope);
            tracing::info!(partner = %message.sender, session = %session.id(), "rekey confirmed");
            Ok(session)
        },
        Err(e) => {
            critical.failed(&envelope);
            tracing::warn!(
                partner = %message.sender,
                session = %session.id(),
                error = %e,
                "confirm not delivered, queued for retry"
            );
            Err(e)
        },
    }
}

/// Handle a `RekeyConfirm` from a partner.
///
/// Confirms the named send session. A confirm for a session that no longer
/// exists is logged and ignored: a crashed partner may resend confirms.
///
/// # Errors
///
/// - `BadTrigger` if the confirm was not end-to-end encrypted or is not a
///   confirm payload
/// - `UnknownPartner` if the sender is not a partner
/// - `Persistence` if the confirmation could not be written
pub fn handle_confirm<S: Storage, E: Environment>(
    store: &Store<S, E>,
    message: &ReceivedMessage,
) -> Result<(), ExchangeError> {
    if message.encryption != Encryption::E2E {
        return Err(RatchetError::BadTrigger("confirm was not end-to-end encrypted".to_string())
            .into());
    }

    let manager = store.get_partner(&message.sender)?;

    let Payload::Confirm(confirm) = Payload::decode(message.message_type, &message.payload)? else {
        return Err(RatchetError::BadTrigger("payload is not a rekey confirm".to_string()).into());
    };

    match manager.confirm(&confirm.session_id) {
        Ok(()) => Ok(()),
        Err(RatchetError::UnknownSession(id)) => {
            tracing::warn!(partner = %message.sender, session = %id, "confirm for unknown session");
            Ok(())
        },
        Err(e) => Err(e.into()),
    }
}
