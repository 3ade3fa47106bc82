//! Supervised negotiation driver.
//!
//! ```text
//!  poller ──(every check_interval)──► trigger_negotiations ──► bounded queue
//!                                                                 │
//!                                   worker 1..N ◄─────────────────┘
//!                                   (negotiate to completion or failure)
//!
//!  inbound ──► dispatcher ──┬─ KeyExchangeTrigger ─► spawned handle_trigger
//!                           ├─ KeyExchangeConfirm ─► handle_confirm
//!                           ├─ unknown key ────────► garbled buffer
//!                           └─ everything else ────► delivered
//! ```
//!
//! Triggers are answered on their own tasks, since answering waits for the
//! confirm's delivery. The dispatcher joins them before it exits.
//!
//! Every task watches one stop signal and exits at its next poll. A fatal
//! (persistence) error raises the signal and is returned from
//! [`NegotiationHandle::shutdown`].

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use ratchetmix_core::{Environment, Manager, RatchetError, Session, Storage, Store};
use ratchetmix_proto::MessageType;
use tokio::{
    sync::{mpsc, watch},
    task::{JoinHandle, JoinSet},
};

use crate::{
    error::ExchangeError,
    handler::{handle_confirm, handle_trigger},
    messages::open,
    transport::{CriticalMessages, Envelope, GarbledMessages, ReceivedMessage, Transport},
    trigger::negotiate,
};

/// Driver timing and sizing.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Interval between negotiation checks
    pub check_interval: Duration,
    /// Worker tasks running negotiations
    pub workers: usize,
    /// Capacity of the negotiation queue
    pub queue_depth: usize,
    /// Bound on waiting for a trigger or confirm to be delivered
    pub round_timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(1),
            workers: 4,
            queue_depth: 64,
            round_timeout: Duration::from_secs(30),
        }
    }
}

struct Work<S: Storage> {
    manager: Arc<Manager<S>>,
    session: Arc<Session<S>>,
}

/// Shared state of the driver's tasks.
struct Shared<S: Storage, E: Environment, T: Transport> {
    store: Arc<Store<S, E>>,
    transport: T,
    critical: Arc<dyn CriticalMessages>,
    garbled: Arc<dyn GarbledMessages>,
    config: DriverConfig,
    stop: Arc<watch::Sender<bool>>,
    fatal: Arc<Mutex<Option<ExchangeError>>>,
}

impl<S: Storage, E: Environment, T: Transport> Shared<S, E, T> {
    /// Record a fatal error and stop every task.
    fn halt(&self, error: ExchangeError) {
        tracing::error!(error = %error, "fatal ratchet error, stopping negotiation driver");
        self.fatal.lock().expect("fatal slot poisoned").get_or_insert(error);
        self.stop.send_replace(true);
    }
}

/// Handle to a running driver.
#[derive(Debug)]
pub struct NegotiationHandle {
    stop: Arc<watch::Sender<bool>>,
    fatal: Arc<Mutex<Option<ExchangeError>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl NegotiationHandle {
    /// Whether the driver stopped on a fatal error.
    pub fn fatal_error(&self) -> Option<ExchangeError> {
        self.fatal.lock().expect("fatal slot poisoned").clone()
    }

    /// Signal every task to stop and wait for them.
    ///
    /// # Errors
    ///
    /// The fatal error that stopped the driver early, if any.
    pub async fn shutdown(self) -> Result<(), ExchangeError> {
        self.stop.send_replace(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "driver task ended abnormally");
            }
        }
        match self.fatal.lock().expect("fatal slot poisoned").take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// The negotiation driver.
#[derive(Debug)]
pub struct NegotiationDriver;

impl NegotiationDriver {
    /// Start the poller, `config.workers` workers and the inbound dispatcher.
    ///
    /// Opened non-ratchet messages are forwarded to `delivered`.
    pub fn spawn<S: Storage, E: Environment, T: Transport>(
        store: Arc<Store<S, E>>,
        transport: T,
        critical: Arc<dyn CriticalMessages>,
        garbled: Arc<dyn GarbledMessages>,
        inbound: mpsc::Receiver<Envelope>,
        delivered: mpsc::Sender<ReceivedMessage>,
        config: DriverConfig,
    ) -> NegotiationHandle {
        let (stop, _) = watch::channel(false);
        let stop = Arc::new(stop);
        let fatal = Arc::new(Mutex::new(None));
        let (queue, work) = mpsc::channel(config.queue_depth.max(1));
        let work = Arc::new(tokio::sync::Mutex::new(work));
        let workers = config.workers.max(1);

        let shared = Arc::new(Shared {
            store,
            transport,
            critical,
            garbled,
            config,
            stop: Arc::clone(&stop),
            fatal: Arc::clone(&fatal),
        });

        let mut tasks = Vec::with_capacity(workers + 2);
        tasks.push(tokio::spawn(poll(Arc::clone(&shared), queue)));
        for worker in 0..workers {
            tasks.push(tokio::spawn(run_worker(Arc::clone(&shared), Arc::clone(&work), worker)));
        }
        tasks.push(tokio::spawn(dispatch(Arc::clone(&shared), inbound, delivered)));

        tracing::info!(workers, "negotiation driver started");

        NegotiationHandle { stop, fatal, tasks }
    }
}

async fn poll<S: Storage, E: Environment, T: Transport>(
    shared: Arc<Shared<S, E, T>>,
    queue: mpsc::Sender<Work<S>>,
) {
    let mut stop = shared.stop.subscribe();
    let env = shared.store.env().clone();

    while !*stop.borrow() {
        tokio::select! {
            _ = stop.changed() => break,
            () = env.sleep(shared.config.check_interval) => {},
        }

        for manager in shared.store.managers() {
            for session in manager.trigger_negotiations(&env) {
                tracing::debug!(
                    partner = %manager.partner(),
                    session = %session.id(),
                    status = ?session.negotiation_status(),
                    "negotiation queued"
                );
                let work = Work { manager: Arc::clone(&manager), session };
                tokio::select! {
                    sent = queue.send(work) => if sent.is_err() { return },
                    _ = stop.changed() => return,
                }
            }
        }
    }
}

async fn run_worker<S: Storage, E: Environment, T: Transport>(
    shared: Arc<Shared<S, E, T>>,
    work: Arc<tokio::sync::Mutex<mpsc::Receiver<Work<S>>>>,
    worker: usize,
) {
    let mut stop = shared.stop.subscribe();

    while !*stop.borrow() {
        let next = {
            let mut work = work.lock().await;
            tokio::select! {
                next = work.recv() => next,
                _ = stop.changed() => None,
            }
        };
        let Some(Work { manager, session }) = next else {
            break;
        };

        let result = negotiate(
            &shared.store,
            &manager,
            session,
            &shared.transport,
            shared.config.round_timeout,
        )
        .await;

        match result {
            Ok(()) => {},
            Err(e) if e.is_fatal() => shared.halt(e),
            Err(e) => tracing::debug!(worker, error = %e, "negotiation attempt failed"),
        }
    }
}

async fn dispatch<S: Storage, E: Environment, T: Transport>(
    shared: Arc<Shared<S, E, T>>,
    mut inbound: mpsc::Receiver<Envelope>,
    delivered: mpsc::Sender<ReceivedMessage>,
) {
    let mut stop = shared.stop.subscribe();
    let mut triggers = JoinSet::new();

    while !*stop.borrow() {
        let envelope = tokio::select! {
            envelope = inbound.recv() => envelope,
            Some(joined) = triggers.join_next(), if !triggers.is_empty() => {
                if let Err(e) = joined {
                    tracing::warn!(error = %e, "trigger task ended abnormally");
                }
                continue;
            },
            _ = stop.changed() => None,
        };
        let Some(envelope) = envelope else {
            break;
        };

        let message = match open(&shared.store, &envelope) {
            Ok(message) => message,
            Err(ExchangeError::Ratchet(RatchetError::UnknownFingerprint)) => {
                tracing::debug!(sender = %envelope.sender, "no key for message, buffering as garbled");
                shared.garbled.add(envelope);
                continue;
            },
            Err(e) if e.is_fatal() => {
                shared.halt(e);
                break;
            },
            Err(e) => {
                tracing::warn!(sender = %envelope.sender, error = %e, "dropping undecryptable message");
                continue;
            },
        };

        let result = match message.message_type {
            MessageType::KeyExchangeTrigger => {
                triggers.spawn(answer_trigger(Arc::clone(&shared), message));
                Ok(())
            },
            MessageType::KeyExchangeConfirm => handle_confirm(&shared.store, &message),
            MessageType::Text => {
                if delivered.send(message).await.is_err() {
                    tracing::debug!("delivery channel closed");
                }
                Ok(())
            },
        };

        match result {
            Ok(()) => {},
            Err(e) if e.is_fatal() => {
                shared.halt(e);
                break;
            },
            Err(e) => tracing::warn!(error = %e, "key exchange message dropped"),
        }
    }

    // Answers in flight stop on the signal or finish their wait.
    while let Some(joined) = triggers.join_next().await {
        if let Err(e) = joined {
            tracing::warn!(error = %e, "trigger task ended abnormally");
        }
    }
}

/// Answer one trigger off the dispatcher, so waiting for the confirm's
/// delivery never holds up other inbound messages.
async fn answer_trigger<S: Storage, E: Environment, T: Transport>(
    shared: Arc<Shared<S, E, T>>,
    message: ReceivedMessage,
) {
    let mut stop = shared.stop.subscribe();
    if *stop.borrow() {
        return;
    }

    let result = tokio::select! {
        result = handle_trigger(
            &shared.store,
            &shared.transport,
            shared.critical.as_ref(),
            shared.garbled.as_ref(),
            &message,
            shared.config.round_timeout,
        ) => result,
        _ = stop.changed() => return,
    };

    match result {
        Ok(session) => tracing::debug!(
            partner = %message.sender,
            session = %session.id(),
            "trigger answered"
        ),
        Err(e) if e.is_fatal() => shared.halt(e),
        Err(e) => tracing::warn!(partner = %message.sender, error = %e, "trigger dropped"),
    }
}
