//! In-process loopback network with fault injection.
//!
//! Every connected client gets a bounded inbox. A send is assigned one round;
//! the round fails if the message is dropped or the recipient's inbox is
//! missing or full. Faults are drawn from a seeded RNG so a run replays
//! exactly.

#![allow(clippy::disallowed_types, reason = "Synchronous locking operations only")]
#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use ratchetmix_client::{Envelope, RoundId, SendReport, Transport, TransportError};
use ratchetmix_proto::PartnerId;
use tokio::sync::mpsc;

/// Capacity of each client's inbox.
pub const INBOX_CAPACITY: usize = 1024;

/// Counters of what the network did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    /// Sends accepted onto a round
    pub sent: u64,
    /// Messages placed in an inbox
    pub delivered: u64,
    /// Messages lost in a failed round
    pub dropped: u64,
    /// Sends refused before a round was assigned
    pub refused: u64,
}

struct NetworkState {
    inboxes: HashMap<PartnerId, mpsc::Sender<Envelope>>,
    rounds: HashMap<RoundId, bool>,
    next_round: RoundId,
    drop_rate: f64,
    refuse_rate: f64,
    rng: ChaCha8Rng,
    stats: NetworkStats,
}

/// Shared loopback network.
#[derive(Clone)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    /// Fault-free network; fault draws are fixed by `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                inboxes: HashMap::new(),
                rounds: HashMap::new(),
                next_round: 1,
                drop_rate: 0.0,
                refuse_rate: 0.0,
                rng: ChaCha8Rng::seed_from_u64(seed),
                stats: NetworkStats::default(),
            })),
        }
    }

    /// Register `client` and return its endpoint.
    ///
    /// Reconnecting replaces the previous inbox; anything still queued in it
    /// is lost, as on a crash.
    pub fn connect(&self, client: PartnerId) -> Endpoint {
        let (injector, inbox) = mpsc::channel(INBOX_CAPACITY);
        self.state
            .lock()
            .expect("network mutex poisoned")
            .inboxes
            .insert(client, injector.clone());
        Endpoint { transport: SimTransport { network: self.clone() }, inbox, injector }
    }

    /// Remove `client`; later sends to it fail their round.
    pub fn disconnect(&self, client: &PartnerId) {
        self.state.lock().expect("network mutex poisoned").inboxes.remove(client);
    }

    /// Probability in [0, 1] that an accepted message is lost.
    pub fn set_drop_rate(&self, rate: f64) {
        assert!((0.0..=1.0).contains(&rate), "drop rate must be in [0.0, 1.0]");
        self.state.lock().expect("network mutex poisoned").drop_rate = rate;
    }

    /// Probability in [0, 1] that a send is refused outright.
    pub fn set_refuse_rate(&self, rate: f64) {
        assert!((0.0..=1.0).contains(&rate), "refuse rate must be in [0.0, 1.0]");
        self.state.lock().expect("network mutex poisoned").refuse_rate = rate;
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> NetworkStats {
        self.state.lock().expect("network mutex poisoned").stats
    }

    fn route(&self, envelope: Envelope) -> Result<SendReport, TransportError> {
        let mut state = self.state.lock().expect("network mutex poisoned");

        let refuse_rate = state.refuse_rate;
        if state.rng.gen_bool(refuse_rate) {
            state.stats.refused += 1;
            return Err(TransportError::Send("simulated gateway refusal".to_string()));
        }

        let round = state.next_round;
        state.next_round += 1;
        state.stats.sent += 1;

        let mut message_id = [0u8; 32];
        state.rng.fill_bytes(&mut message_id);

        let drop_rate = state.drop_rate;
        let lost = state.rng.gen_bool(drop_rate);
        let delivered = !lost
            && state
                .inboxes
                .get(&envelope.recipient)
                .is_some_and(|inbox| inbox.try_send(envelope.clone()).is_ok());

        if delivered {
            state.stats.delivered += 1;
        } else {
            state.stats.dropped += 1;
            tracing::debug!(
                round,
                recipient = %envelope.recipient,
                message_type = ?envelope.message_type,
                "round failed"
            );
        }
        state.rounds.insert(round, delivered);

        Ok(SendReport { rounds: vec![round], message_id, timestamp_secs: round })
    }

    fn rounds_succeeded(&self, rounds: &[RoundId]) -> bool {
        let state = self.state.lock().expect("network mutex poisoned");
        rounds.iter().all(|round| state.rounds.get(round).copied().unwrap_or(false))
    }
}

impl std::fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackNetwork").field("stats", &self.stats()).finish_non_exhaustive()
    }
}

/// A connected client's side of the network.
#[derive(Debug)]
pub struct Endpoint {
    /// Outgoing messages
    pub transport: SimTransport,
    /// Incoming messages
    pub inbox: mpsc::Receiver<Envelope>,
    /// Sender into `inbox`, for re-injecting buffered messages
    pub injector: mpsc::Sender<Envelope>,
}

/// One client's handle on the loopback network.
#[derive(Clone, Debug)]
pub struct SimTransport {
    network: LoopbackNetwork,
}

impl SimTransport {
    /// The network this transport sends on.
    pub fn network(&self) -> &LoopbackNetwork {
        &self.network
    }
}

impl Transport for SimTransport {
    async fn send_e2e(&self, envelope: Envelope) -> Result<SendReport, TransportError> {
        self.network.route(envelope)
    }

    async fn wait_for_rounds(
        &self,
        rounds: &[RoundId],
        _timeout: Duration,
    ) -> Result<bool, TransportError> {
        // Rounds settle synchronously on send.
        Ok(self.network.rounds_succeeded(rounds))
    }
}

#[cfg(test)]
mod tests {
    use ratchetmix_client::Body;
    use ratchetmix_proto::MessageType;

    use super::*;

    fn envelope(to: PartnerId) -> Envelope {
        Envelope {
            sender: PartnerId::from_bytes([1; 32]),
            recipient: to,
            message_type: MessageType::Text,
            body: Body::Plain(b"hello".to_vec()),
        }
    }

    #[tokio::test]
    async fn delivers_to_connected_client() {
        let network = LoopbackNetwork::new(1);
        let bob = PartnerId::from_bytes([2; 32]);
        let Endpoint { transport, mut inbox, .. } = network.connect(bob);

        let report = transport.send_e2e(envelope(bob)).await.unwrap();

        assert!(transport.wait_for_rounds(&report.rounds, Duration::ZERO).await.unwrap());
        assert_eq!(inbox.recv().await.unwrap(), envelope(bob));
        assert_eq!(network.stats().delivered, 1);
    }

    #[tokio::test]
    async fn unknown_recipient_fails_round() {
        let network = LoopbackNetwork::new(1);
        let transport = network.connect(PartnerId::from_bytes([2; 32])).transport;

        let report = transport.send_e2e(envelope(PartnerId::from_bytes([3; 32]))).await.unwrap();

        assert!(!transport.wait_for_rounds(&report.rounds, Duration::ZERO).await.unwrap());
        assert_eq!(network.stats().dropped, 1);
    }

    #[tokio::test]
    async fn full_drop_rate_loses_everything() {
        let network = LoopbackNetwork::new(1);
        let bob = PartnerId::from_bytes([2; 32]);
        let Endpoint { transport, mut inbox, .. } = network.connect(bob);
        network.set_drop_rate(1.0);

        for _ in 0..10 {
            let report = transport.send_e2e(envelope(bob)).await.unwrap();
            assert!(!transport.wait_for_rounds(&report.rounds, Duration::ZERO).await.unwrap());
        }

        assert!(inbox.try_recv().is_err());
        assert_eq!(network.stats(), NetworkStats { sent: 10, dropped: 10, ..Default::default() });
    }

    #[tokio::test]
    async fn full_refuse_rate_refuses_everything() {
        let network = LoopbackNetwork::new(1);
        let bob = PartnerId::from_bytes([2; 32]);
        let transport = network.connect(bob).transport;
        network.set_refuse_rate(1.0);

        let result = transport.send_e2e(envelope(bob)).await;

        assert!(matches!(result, Err(TransportError::Send(_))));
        assert_eq!(network.stats().refused, 1);
    }

    #[tokio::test]
    async fn reconnect_replaces_inbox() {
        let network = LoopbackNetwork::new(1);
        let bob = PartnerId::from_bytes([2; 32]);
        let old = network.connect(bob);
        let mut new = network.connect(bob);

        old.transport.send_e2e(envelope(bob)).await.unwrap();

        assert_eq!(new.inbox.recv().await.unwrap(), envelope(bob));
    }

    #[tokio::test]
    async fn unknown_round_is_not_successful() {
        let network = LoopbackNetwork::new(1);
        let transport = network.connect(PartnerId::from_bytes([2; 32])).transport;

        assert!(!transport.wait_for_rounds(&[999], Duration::ZERO).await.unwrap());
    }
}
