//! Recording implementations of the client's message buffers.

#![allow(clippy::disallowed_types, reason = "Synchronous locking operations only")]
#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use ratchetmix_client::{CriticalMessages, Envelope, GarbledMessages, Transport};
use tokio::sync::mpsc;

#[derive(Default)]
struct CriticalState {
    processing: Vec<Envelope>,
    failed: Vec<Envelope>,
    succeeded: usize,
}

/// Critical-message buffer that records every transition.
///
/// Failed messages are kept until [`RecordingCritical::resend_failed`] hands
/// them to a transport again.
#[derive(Clone, Default)]
pub struct RecordingCritical {
    state: Arc<Mutex<CriticalState>>,
}

impl RecordingCritical {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages currently in flight.
    pub fn processing(&self) -> usize {
        self.state.lock().expect("critical mutex poisoned").processing.len()
    }

    /// Messages waiting for a resend.
    pub fn failed_messages(&self) -> Vec<Envelope> {
        self.state.lock().expect("critical mutex poisoned").failed.clone()
    }

    /// Messages delivered so far.
    pub fn delivered(&self) -> usize {
        self.state.lock().expect("critical mutex poisoned").succeeded
    }

    /// Send every failed message again and return how many were delivered.
    ///
    /// A message that fails again stays in the failed list.
    pub async fn resend_failed<T: Transport>(&self, transport: &T, timeout: Duration) -> usize {
        let pending = std::mem::take(&mut self.state.lock().expect("critical mutex poisoned").failed);

        let mut delivered = 0;
        for envelope in pending {
            self.add_processing(&envelope);
            let ok = match transport.send_e2e(envelope.clone()).await {
                Ok(report) => transport.wait_for_rounds(&report.rounds, timeout).await.unwrap_or(false),
                Err(_) => false,
            };
            if ok {
                self.succeeded(&envelope);
                delivered += 1;
            } else {
                self.failed(&envelope);
            }
        }
        delivered
    }
}

impl CriticalState {
    fn finish(&mut self, envelope: &Envelope) {
        if let Some(at) = self.processing.iter().position(|e| e == envelope) {
            self.processing.swap_remove(at);
        }
    }
}

impl CriticalMessages for RecordingCritical {
    fn add_processing(&self, envelope: &Envelope) {
        self.state.lock().expect("critical mutex poisoned").processing.push(envelope.clone());
    }

    fn succeeded(&self, envelope: &Envelope) {
        let mut state = self.state.lock().expect("critical mutex poisoned");
        state.finish(envelope);
        state.succeeded += 1;
    }

    fn failed(&self, envelope: &Envelope) {
        let mut state = self.state.lock().expect("critical mutex poisoned");
        state.finish(envelope);
        state.failed.push(envelope.clone());
    }
}

impl std::fmt::Debug for RecordingCritical {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("critical mutex poisoned");
        f.debug_struct("RecordingCritical")
            .field("processing", &state.processing.len())
            .field("failed", &state.failed.len())
            .field("succeeded", &state.succeeded)
            .finish()
    }
}

/// Garbled-message buffer that re-injects into the owner's inbox on check.
pub struct ReinjectingGarbled {
    buffered: Mutex<Vec<Envelope>>,
    inbox: mpsc::Sender<Envelope>,
    checks: AtomicUsize,
}

impl ReinjectingGarbled {
    /// Buffer that feeds retried messages to `inbox`.
    pub fn new(inbox: mpsc::Sender<Envelope>) -> Self {
        Self { buffered: Mutex::new(Vec::new()), inbox, checks: AtomicUsize::new(0) }
    }

    /// Messages currently buffered.
    pub fn len(&self) -> usize {
        self.buffered.lock().expect("garbled mutex poisoned").len()
    }

    /// True if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Times a recheck was requested.
    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

impl GarbledMessages for ReinjectingGarbled {
    fn add(&self, envelope: Envelope) {
        self.buffered.lock().expect("garbled mutex poisoned").push(envelope);
    }

    fn check_garbled_messages(&self) {
        self.checks.fetch_add(1, Ordering::SeqCst);

        let mut buffered = self.buffered.lock().expect("garbled mutex poisoned");
        let pending = std::mem::take(&mut *buffered);
        for envelope in pending {
            if let Err(e) = self.inbox.try_send(envelope) {
                buffered.push(e.into_inner());
            }
        }
        tracing::debug!(remaining = buffered.len(), "garbled messages re-injected");
    }
}

impl std::fmt::Debug for ReinjectingGarbled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReinjectingGarbled")
            .field("buffered", &self.len())
            .field("checks", &self.checks())
            .finish_non_exhaustive()
    }
}
