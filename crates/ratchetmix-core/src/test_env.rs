//! Seeded environment for unit tests.

#![allow(clippy::disallowed_types, reason = "Synchronous RNG access only")]
#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::env::Environment;

/// Deterministic environment: seeded RNG, zero clock, instant sleeps.
#[derive(Clone)]
pub(crate) struct TestEnv {
    rng: Arc<Mutex<ChaCha8Rng>>,
}

impl TestEnv {
    pub(crate) fn with_seed(seed: u64) -> Self {
        Self { rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))) }
    }
}

impl Environment for TestEnv {
    type Instant = Duration;

    fn now(&self) -> Duration {
        Duration::ZERO
    }

    async fn sleep(&self, _duration: Duration) {}

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().expect("rng mutex poisoned").fill_bytes(buffer);
    }
}
