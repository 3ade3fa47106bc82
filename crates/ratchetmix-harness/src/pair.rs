//! Two partners wired together over the loopback network.
//!
//! Each [`SimClient`] owns a store, a transport endpoint, recording buffers
//! and (once started) a negotiation driver. [`SimClient::restart`] drops all
//! in-memory state and reloads the store from storage, as a crash would.

use std::{sync::Arc, time::Duration};

use ratchetmix_client::{
    DriverConfig, Envelope, ExchangeError, NegotiationDriver, NegotiationHandle, ReceivedMessage,
    SendReport, send_message,
};
use ratchetmix_core::{
    Environment, Manager, MemoryStorage, RatchetError, SessionParams, Storage, Store,
};
use ratchetmix_crypto::PrivateKey;
use ratchetmix_proto::{MessageType, PartnerId};
use tokio::sync::mpsc;

use crate::{
    buffers::{RecordingCritical, ReinjectingGarbled},
    invariants::{InvariantRegistry, StoreSnapshot},
    network::{Endpoint, LoopbackNetwork, SimTransport},
    sim_env::SimEnv,
};

/// Capacity of the channel of delivered application messages.
const DELIVERED_CAPACITY: usize = 1024;

/// One simulated client.
pub struct SimClient<S: Storage> {
    id: PartnerId,
    storage: S,
    env: SimEnv,
    network: LoopbackNetwork,
    store: Arc<Store<S, SimEnv>>,
    transport: SimTransport,
    critical: Arc<RecordingCritical>,
    garbled: Arc<ReinjectingGarbled>,
    inbox: Option<mpsc::Receiver<Envelope>>,
    delivered: Option<mpsc::Receiver<ReceivedMessage>>,
    driver: Option<NegotiationHandle>,
}

impl<S: Storage> SimClient<S> {
    /// Create a client with an empty store on `storage`.
    pub fn new(
        id: PartnerId,
        storage: S,
        env: SimEnv,
        network: &LoopbackNetwork,
    ) -> Result<Self, RatchetError> {
        let store = Store::new(storage.clone(), env.clone(), id)?;
        Ok(Self::assemble(id, storage, env, network.clone(), store))
    }

    fn assemble(
        id: PartnerId,
        storage: S,
        env: SimEnv,
        network: LoopbackNetwork,
        store: Store<S, SimEnv>,
    ) -> Self {
        let Endpoint { transport, inbox, injector } = network.connect(id);
        Self {
            id,
            storage,
            env,
            network,
            store: Arc::new(store),
            transport,
            critical: Arc::new(RecordingCritical::new()),
            garbled: Arc::new(ReinjectingGarbled::new(injector)),
            inbox: Some(inbox),
            delivered: None,
            driver: None,
        }
    }

    /// This client's identity.
    pub fn id(&self) -> PartnerId {
        self.id
    }

    /// The client's store.
    pub fn store(&self) -> &Arc<Store<S, SimEnv>> {
        &self.store
    }

    /// The client's transport.
    pub fn transport(&self) -> &SimTransport {
        &self.transport
    }

    /// Critical-message buffer.
    pub fn critical(&self) -> &RecordingCritical {
        &self.critical
    }

    /// Garbled-message buffer.
    pub fn garbled(&self) -> &ReinjectingGarbled {
        &self.garbled
    }

    /// The manager for `partner`.
    pub fn manager(&self, partner: &PartnerId) -> Result<Arc<Manager<S>>, RatchetError> {
        self.store.get_partner(partner)
    }

    /// True while a driver is running.
    pub fn is_running(&self) -> bool {
        self.driver.is_some()
    }

    /// Start the negotiation driver on this client's inbox.
    ///
    /// Does nothing if a driver is already running.
    pub fn start(&mut self, config: DriverConfig) {
        let Some(inbox) = self.inbox.take() else {
            return;
        };
        let (delivered_tx, delivered_rx) = mpsc::channel(DELIVERED_CAPACITY);

        let critical: Arc<RecordingCritical> = Arc::clone(&self.critical);
        let garbled: Arc<ReinjectingGarbled> = Arc::clone(&self.garbled);
        self.driver = Some(NegotiationDriver::spawn(
            Arc::clone(&self.store),
            self.transport.clone(),
            critical,
            garbled,
            inbox,
            delivered_tx,
            config,
        ));
        self.delivered = Some(delivered_rx);
    }

    /// Stop the driver and wait for its tasks.
    pub async fn shutdown(&mut self) -> Result<(), ExchangeError> {
        match self.driver.take() {
            Some(driver) => driver.shutdown().await,
            None => Ok(()),
        }
    }

    /// Simulate a crash: stop the driver, drop all in-memory state and
    /// reload the store from storage.
    ///
    /// Messages queued in the old inbox are lost. The critical buffer
    /// survives, as it would in a client that persists it.
    pub async fn restart(&mut self) -> Result<(), ExchangeError> {
        if let Err(e) = self.shutdown().await {
            tracing::warn!(client = %self.id, error = %e, "driver had stopped on an error");
        }

        let store = Store::load(self.storage.clone(), self.env.clone())?;
        let critical = Arc::clone(&self.critical);
        let network = self.network.clone();
        *self = Self::assemble(self.id, self.storage.clone(), self.env.clone(), network, store);
        self.critical = critical;

        tracing::info!(client = %self.id, "client restarted from storage");
        Ok(())
    }

    /// Send application text to `partner`.
    pub async fn send_text(
        &self,
        partner: PartnerId,
        text: &[u8],
    ) -> Result<SendReport, ExchangeError> {
        send_message(&self.store, &self.transport, partner, MessageType::Text, text).await
    }

    /// Next delivered application message, waiting up to `timeout`.
    pub async fn next_delivered(&mut self, timeout: Duration) -> Option<ReceivedMessage> {
        let delivered = self.delivered.as_mut()?;
        tokio::time::timeout(timeout, delivered.recv()).await.ok().flatten()
    }

    /// Messages waiting in the inbox of a client whose driver is not
    /// running, oldest first.
    pub fn pending_inbox(&mut self) -> Vec<Envelope> {
        let mut pending = Vec::new();
        if let Some(inbox) = self.inbox.as_mut() {
            while let Ok(envelope) = inbox.try_recv() {
                pending.push(envelope);
            }
        }
        pending
    }

    /// Resend failed critical messages.
    pub async fn resend_critical(&self, timeout: Duration) -> usize {
        self.critical.resend_failed(&self.transport, timeout).await
    }

    /// Capture this client's ratchet state.
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot::capture(&self.store)
    }
}

impl<S: Storage> std::fmt::Debug for SimClient<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimClient")
            .field("id", &self.id)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// Alice and Bob, partnered with each other.
pub struct SimPair<S: Storage> {
    /// First client
    pub alice: SimClient<S>,
    /// Second client
    pub bob: SimClient<S>,
    /// The network both are connected to
    pub network: LoopbackNetwork,
}

impl SimPair<MemoryStorage> {
    /// Pair on fresh in-memory storage.
    pub fn in_memory(seed: u64, params: SessionParams) -> Result<Self, RatchetError> {
        Self::new(seed, MemoryStorage::new(), MemoryStorage::new(), params)
    }
}

impl<S: Storage> SimPair<S> {
    /// Pair on the given storages, each partnered with the other.
    ///
    /// Both sides use `params` for sending and receiving, so mirrored
    /// sessions have the same pool shape.
    pub fn new(
        seed: u64,
        alice_storage: S,
        bob_storage: S,
        params: SessionParams,
    ) -> Result<Self, RatchetError> {
        let env = SimEnv::with_seed(seed);
        let network = LoopbackNetwork::new(env.random_u64());

        let (alice_env, bob_env) = (env.fork(), env.fork());
        let alice_id = PartnerId::from_bytes(random_array(&env));
        let bob_id = PartnerId::from_bytes(random_array(&env));
        let alice_private = PrivateKey::from_random_bytes(random_array(&env));
        let bob_private = PrivateKey::from_random_bytes(random_array(&env));
        let (alice_public, bob_public) = (alice_private.public_key(), bob_private.public_key());

        let alice = SimClient::new(alice_id, alice_storage, alice_env, &network)?;
        let bob = SimClient::new(bob_id, bob_storage, bob_env, &network)?;

        alice.store.add_partner(bob_id, bob_public, alice_private, params, params)?;
        bob.store.add_partner(alice_id, alice_public, bob_private, params, params)?;

        Ok(Self { alice, bob, network })
    }

    /// Start both drivers.
    pub fn start(&mut self, config: &DriverConfig) {
        self.alice.start(config.clone());
        self.bob.start(config.clone());
    }

    /// Stop both drivers, returning the first fatal error.
    pub async fn shutdown(&mut self) -> Result<(), ExchangeError> {
        let alice = self.alice.shutdown().await;
        let bob = self.bob.shutdown().await;
        alice.and(bob)
    }

    /// Assert `registry` holds for both clients.
    pub fn assert_invariants(&self, registry: &InvariantRegistry, context: &str) {
        registry.assert_all(&self.alice.snapshot(), &format!("alice {context}"));
        registry.assert_all(&self.bob.snapshot(), &format!("bob {context}"));
    }
}

impl<S: Storage> std::fmt::Debug for SimPair<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimPair")
            .field("alice", &self.alice)
            .field("bob", &self.bob)
            .field("network", &self.network)
            .finish()
    }
}

fn random_array<E: Environment>(env: &E) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    env.random_bytes(&mut bytes);
    bytes
}
