//! Sealing outgoing messages and opening incoming ones.

use ratchetmix_core::{Environment, Key, RatchetError, Storage, Store};
use ratchetmix_crypto::NONCE_SIZE;
use ratchetmix_proto::{MessageType, PartnerId};

use crate::{
    error::ExchangeError,
    transport::{Body, Envelope, ReceivedMessage, SendReport, Transport},
};

/// Encrypt `payload` under `key` into an envelope for `recipient`.
pub fn seal<S: Storage, E: Environment>(
    env: &E,
    sender: PartnerId,
    recipient: PartnerId,
    message_type: MessageType,
    key: &Key<S>,
    payload: &[u8],
) -> Envelope {
    let mut nonce = [0u8; NONCE_SIZE];
    env.random_bytes(&mut nonce);

    Envelope { sender, recipient, message_type, body: Body::E2E(key.encrypt(payload, nonce)) }
}

/// Decrypt an incoming envelope and consume its key.
///
/// The key is consumed only after authentication succeeds, so a tampered
/// message cannot burn a key. The sender is taken from the session the key
/// belongs to, not from the envelope.
///
/// # Errors
///
/// - `UnknownFingerprint` if no unused key matches (garbled or replayed)
/// - `Crypto` if authentication fails
/// - `Persistence` if consuming the key fails
pub fn open<S: Storage, E: Environment>(
    store: &Store<S, E>,
    envelope: &Envelope,
) -> Result<ReceivedMessage, ExchangeError> {
    let (sender, payload) = match &envelope.body {
        Body::E2E(sealed) => {
            let key = store
                .fingerprints()
                .get(&sealed.fingerprint)
                .ok_or(RatchetError::UnknownFingerprint)?;
            let payload = key.decrypt(sealed)?;
            store.pop_key(&sealed.fingerprint)?;

            if key.session().partner() != envelope.sender {
                tracing::warn!(
                    claimed = %envelope.sender,
                    actual = %key.session().partner(),
                    "envelope sender does not own the key"
                );
            }
            (key.session().partner(), payload)
        },
        Body::Plain(payload) => (envelope.sender, payload.clone()),
    };

    Ok(ReceivedMessage {
        sender,
        message_type: envelope.message_type,
        encryption: envelope.encryption(),
        payload,
    })
}

/// Send an application message to `partner` on the current sending session.
///
/// # Errors
///
/// - `UnknownPartner` if the partner is not in the store
/// - `NoSendableSession` if every send session is exhausted
/// - `Transport` if the transport refuses the message
pub async fn send_message<S: Storage, E: Environment, T: Transport>(
    store: &Store<S, E>,
    transport: &T,
    partner: PartnerId,
    message_type: MessageType,
    payload: &[u8],
) -> Result<SendReport, ExchangeError> {
    let manager = store.get_partner(&partner)?;
    let key = manager.pop_send_key()?;

    tracing::debug!(%partner, session = %key.session().id(), index = key.index(), "sending message");

    let envelope = seal(store.env(), store.my_id(), partner, message_type, &key, payload);
    Ok(transport.send_e2e(envelope).await?)
}
