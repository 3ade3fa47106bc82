//! Negotiation driver dispatch under a slow network.
//!
//! Runs on a paused tokio clock, so the delivery waits below cost no
//! wall-clock time.

use std::{sync::Arc, time::Duration};

use ratchetmix_client::{
    DriverConfig, Envelope, NegotiationDriver, RoundId, SendReport, Transport, TransportError,
    seal,
};
use ratchetmix_core::{MemoryStorage, SessionParams};
use ratchetmix_harness::{Endpoint, RecordingCritical, ReinjectingGarbled, SimPair, SimTransport};
use ratchetmix_proto::{Payload, RekeyTrigger};
use tokio::sync::mpsc;

/// Delivery confirmation takes `delay` on every round.
#[derive(Clone)]
struct SlowRounds {
    inner: SimTransport,
    delay: Duration,
}

impl Transport for SlowRounds {
    async fn send_e2e(&self, envelope: Envelope) -> Result<SendReport, TransportError> {
        self.inner.send_e2e(envelope).await
    }

    async fn wait_for_rounds(
        &self,
        rounds: &[RoundId],
        timeout: Duration,
    ) -> Result<bool, TransportError> {
        tokio::time::sleep(self.delay).await;
        self.inner.wait_for_rounds(rounds, timeout).await
    }
}

const CONFIRM_DELAY: Duration = Duration::from_secs(60);

fn config() -> DriverConfig {
    DriverConfig {
        check_interval: Duration::from_secs(1),
        workers: 1,
        queue_depth: 4,
        round_timeout: Duration::from_secs(120),
    }
}

/// Alice's trigger for a fresh send session, sealed for Bob.
fn trigger_envelope(pair: &SimPair<MemoryStorage>) -> Envelope {
    let bob = pair.bob.id();
    let manager = pair.alice.manager(&bob).unwrap();
    let env = pair.alice.store().env();

    let session = manager.new_send_session(None, manager.send_params(), env).unwrap();
    let payload = Payload::Trigger(RekeyTrigger {
        session_id: session.trigger_session(),
        public_key: *session.my_public_key().as_bytes(),
    });
    let key = manager.pop_rekey_key().unwrap();

    seal(env, pair.alice.id(), bob, payload.message_type(), &key, &payload.encode().unwrap())
}

#[tokio::test(start_paused = true)]
async fn text_behind_a_trigger_is_not_held_by_the_confirm_wait() {
    let pair = SimPair::in_memory(21, SessionParams::default()).unwrap();
    let (alice, bob) = (pair.alice.id(), pair.bob.id());

    // Bob's driver runs on a fresh endpoint whose rounds settle slowly.
    let Endpoint { transport, inbox, injector } = pair.network.connect(bob);
    let critical = Arc::new(RecordingCritical::new());
    let (delivered_tx, mut delivered) = mpsc::channel(16);
    let driver = NegotiationDriver::spawn(
        Arc::clone(pair.bob.store()),
        SlowRounds { inner: transport, delay: CONFIRM_DELAY },
        critical.clone(),
        Arc::new(ReinjectingGarbled::new(injector)),
        inbox,
        delivered_tx,
        config(),
    );

    let trigger = trigger_envelope(&pair);
    pair.alice.transport().send_e2e(trigger).await.unwrap();
    pair.alice.send_text(bob, b"after the trigger").await.unwrap();

    let text = tokio::time::timeout(Duration::from_secs(1), delivered.recv())
        .await
        .expect("text was held behind the trigger")
        .unwrap();
    assert_eq!(text.sender, alice);
    assert_eq!(text.payload, b"after the trigger");

    let bob_manager = pair.bob.manager(&alice).unwrap();
    assert_eq!(bob_manager.receive_relationship().len(), 2);
    assert_eq!(critical.delivered(), 0);

    tokio::time::sleep(CONFIRM_DELAY + Duration::from_secs(1)).await;
    assert_eq!(critical.delivered(), 1);
    assert_eq!(critical.processing(), 0);

    driver.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_does_not_wait_out_a_pending_confirm() {
    let pair = SimPair::in_memory(22, SessionParams::default()).unwrap();
    let bob = pair.bob.id();

    let Endpoint { transport, inbox, injector } = pair.network.connect(bob);
    let critical = Arc::new(RecordingCritical::new());
    let (delivered_tx, _delivered) = mpsc::channel(16);
    let driver = NegotiationDriver::spawn(
        Arc::clone(pair.bob.store()),
        SlowRounds { inner: transport, delay: CONFIRM_DELAY },
        critical.clone(),
        Arc::new(ReinjectingGarbled::new(injector)),
        inbox,
        delivered_tx,
        config(),
    );

    pair.alice.transport().send_e2e(trigger_envelope(&pair)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(critical.processing(), 1);

    let started = tokio::time::Instant::now();
    driver.shutdown().await.unwrap();

    assert!(started.elapsed() < CONFIRM_DELAY);
    assert_eq!(critical.delivered(), 0);
}
