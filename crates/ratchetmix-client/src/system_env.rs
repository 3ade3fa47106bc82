//! Production [`Environment`] backed by the OS clock and RNG.
//!
//! Time comes from `std::time::Instant`, sleeping from tokio and randomness
//! from getrandom. Nothing here is reproducible; simulations use the
//! harness environment instead.

use std::time::Duration;

use ratchetmix_core::Environment;

/// System time and OS cryptographic randomness.
///
/// # Panics
///
/// `random_bytes` panics if the OS RNG fails. Every session private key and
/// message nonce is drawn from it, so there is no safe way to continue.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure leaves no safe key source");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::disallowed_methods)]
    fn time_advances() {
        let env = SystemEnv::new();

        let t1 = env.now();
        std::thread::sleep(Duration::from_millis(5));
        assert!(env.now() > t1);
    }

    #[test]
    fn private_key_material_differs() {
        let env = SystemEnv::new();

        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        env.random_bytes(&mut a);
        env.random_bytes(&mut b);

        assert_ne!(a, b);
    }

    #[test]
    fn retry_draws_stay_in_unit_interval() {
        let env = SystemEnv::new();

        for _ in 0..1000 {
            let draw = env.random_f64();
            assert!((0.0..1.0).contains(&draw));
        }
    }

    #[tokio::test]
    async fn sleep_waits() {
        let env = SystemEnv::new();

        let start = env.now();
        env.sleep(Duration::from_millis(20)).await;
        assert!(env.now() - start >= Duration::from_millis(20));
    }
}
