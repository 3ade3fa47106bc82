//! Sender side of the key exchange.
//!
//! ```text
//! Confirmed ─► NewSessionTriggered ─► (new session: Sending) ─► send trigger
//!                     │                                            │
//!                     ▼                              ok ◄──────────┴────────► failed
//!             NewSessionCreated                      Sent                  Unconfirmed
//! ```

use std::{sync::Arc, time::Duration};

use ratchetmix_core::{
    Environment, Manager, NegotiationStatus, RatchetError, Session, Storage, Store,
};
use ratchetmix_proto::{MessageType, Payload, RekeyTrigger};

use crate::{
    error::ExchangeError,
    messages::seal,
    transport::{SendReport, Transport},
};

/// Run one negotiation for `session` to completion or failure.
///
/// `session` is a send session flagged by `trigger_negotiations`:
/// - `NewSessionTriggered`: a successor is created and announced, and
///   `session` moves to `NewSessionCreated`
/// - `Sending`: `session` itself is re-announced
///
/// On success the announced session is `Sent`. On a send failure or timeout
/// it reverts to `Unconfirmed` so a later cycle retries it.
///
/// # Errors
///
/// - `Ratchet` if session creation or a status write fails
/// - `Transport`, `Timeout` or `DeliveryFailed` if the trigger was not
///   delivered
pub async fn negotiate<S: Storage, E: Environment, T: Transport>(
    store: &Store<S, E>,
    manager: &Manager<S>,
    session: Arc<Session<S>>,
    transport: &T,
    round_timeout: Duration,
) -> Result<(), ExchangeError> {
    let announced = match session.negotiation_status() {
        NegotiationStatus::NewSessionTriggered => {
            match manager.new_send_session(None, manager.send_params(), store.env()) {
                Ok(created) => {
                    session.set_negotiation_status(NegotiationStatus::NewSessionCreated)?;
                    created
                },
                Err(e) => {
                    session.set_negotiation_status(NegotiationStatus::Confirmed)?;
                    return Err(e.into());
                },
            }
        },
        NegotiationStatus::Sending => session,
        status => {
            tracing::debug!(session = %session.id(), ?status, "nothing to negotiate");
            return Ok(());
        },
    };

    match announce(store, manager, &announced, transport, round_timeout).await {
        Ok(report) => {
            settle(&announced, NegotiationStatus::Sent)?;
            tracing::info!(
                partner = %manager.partner(),
                session = %announced.id(),
                rounds = ?report.rounds,
                "rekey trigger delivered"
            );
            Ok(())
        },
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            settle(&announced, NegotiationStatus::Unconfirmed)?;
            tracing::warn!(
                partner = %manager.partner(),
                session = %announced.id(),
                error = %e,
                "rekey trigger failed, will retry"
            );
            Err(e)
        },
    }
}

async fn announce<S: Storage, E: Environment, T: Transport>(
    store: &Store<S, E>,
    manager: &Manager<S>,
    session: &Session<S>,
    transport: &T,
    round_timeout: Duration,
) -> Result<SendReport, ExchangeError> {
    let payload = Payload::Trigger(RekeyTrigger {
        session_id: session.trigger_session(),
        public_key: *session.my_public_key().as_bytes(),
    })
    .encode()?;

    let key = manager.pop_rekey_key()?;
    let envelope = seal(
        store.env(),
        store.my_id(),
        manager.partner(),
        MessageType::KeyExchangeTrigger,
        &key,
        &payload,
    );

    let report = transport.send_e2e(envelope).await?;
    wait_for_delivery(transport, &report, round_timeout).await?;
    Ok(report)
}

/// Wait for the rounds of `report`, bounded by `round_timeout`.
pub(crate) async fn wait_for_delivery<T: Transport>(
    transport: &T,
    report: &SendReport,
    round_timeout: Duration,
) -> Result<(), ExchangeError> {
    let waited =
        tokio::time::timeout(round_timeout, transport.wait_for_rounds(&report.rounds, round_timeout))
            .await;

    match waited {
        Ok(Ok(true)) => Ok(()),
        Ok(Ok(false)) => Err(ExchangeError::DeliveryFailed),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(ExchangeError::Timeout(round_timeout)),
    }
}

/// Move `session` to `status` unless a confirm overtook the negotiation.
fn settle<S: Storage>(session: &Session<S>, status: NegotiationStatus) -> Result<(), RatchetError> {
    match session.set_negotiation_status(status) {
        Err(RatchetError::IllegalTransition { .. }) if session.is_confirmed() => {
            tracing::debug!(session = %session.id(), "confirm arrived before trigger settled");
            Ok(())
        },
        result => result,
    }
}
