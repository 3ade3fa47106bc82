//! Clock and entropy supplied by the host.
//!
//! The ratchet never reads the system clock or the OS RNG directly. Every
//! session private key, every nonce and every retry draw comes through an
//! [`Environment`], so a seeded implementation replays a whole run.

use std::{future::Future, ops::Sub, time::Duration};

/// Time and randomness for the ratchet and its driver.
///
/// Production implementations must draw `random_bytes` from a
/// cryptographically secure source: the bytes become private keys.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Monotonic instant.
    type Instant: Copy + Ord + Send + Sync + Sub<Output = Duration>;

    /// Current instant. Never earlier than a previous call.
    fn now(&self) -> Self::Instant;

    /// Wait for `duration`. Only the negotiation driver sleeps.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;

    /// Fill `buffer` with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Random `u64`, big-endian over eight random bytes.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Uniform draw in `[0.0, 1.0)` from the top 53 bits of `random_u64`.
    fn random_f64(&self) -> f64 {
        (self.random_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}
