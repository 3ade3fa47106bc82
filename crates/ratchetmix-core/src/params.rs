//! Key pool sizing parameters.

use ratchetmix_crypto::TtlParams;
use serde::{Deserialize, Serialize};

use crate::error::RatchetError;

/// Largest key pool a session may be generated with.
pub const MAX_POOL_KEYS: u32 = 1 << 20;

/// Parameters controlling the size of a session's key pool and when it is
/// renegotiated.
///
/// Stored with each session so a pool keeps the shape it was generated with
/// even if the defaults change later.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionParams {
    /// Lower bound of the ttl sample.
    pub min_keys: u32,
    /// Upper bound (exclusive) of the ttl sample.
    pub max_keys: u32,
    /// Keys held back for rekey traffic only.
    pub num_rekeys: u32,
    /// Pool size as a multiple of ttl.
    pub ttl_scalar: f64,
    /// Pool size floor.
    pub min_num_keys: u32,
    /// Probability that a pass of the negotiation loop re-announces an
    /// unconfirmed session that does not yet need a rekey.
    pub unconfirmed_retry_ratio: f64,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            min_keys: 500,
            max_keys: 800,
            num_rekeys: 128,
            ttl_scalar: 1.2,
            min_num_keys: 224,
            unconfirmed_retry_ratio: 0.1,
        }
    }
}

impl SessionParams {
    /// Check the parameters describe a usable pool.
    ///
    /// # Errors
    ///
    /// `RatchetError::InvalidParams` naming the first violated constraint.
    pub fn validate(&self) -> Result<(), RatchetError> {
        if self.min_keys == 0 {
            return Err(RatchetError::InvalidParams("min_keys must be positive".to_string()));
        }
        if self.max_keys <= self.min_keys {
            return Err(RatchetError::InvalidParams(format!(
                "max_keys ({}) must exceed min_keys ({})",
                self.max_keys, self.min_keys
            )));
        }
        if self.num_rekeys >= self.min_keys {
            return Err(RatchetError::InvalidParams(format!(
                "num_rekeys ({}) must be below min_keys ({})",
                self.num_rekeys, self.min_keys
            )));
        }
        if !(self.ttl_scalar.is_finite() && self.ttl_scalar > 0.0) {
            return Err(RatchetError::InvalidParams(format!(
                "ttl_scalar must be positive, got {}",
                self.ttl_scalar
            )));
        }
        if self.min_num_keys > MAX_POOL_KEYS {
            return Err(RatchetError::InvalidParams(format!(
                "min_num_keys ({}) exceeds {MAX_POOL_KEYS}",
                self.min_num_keys
            )));
        }
        if f64::from(self.max_keys) * self.ttl_scalar > f64::from(MAX_POOL_KEYS) {
            return Err(RatchetError::InvalidParams(format!(
                "max_keys ({}) scaled by {} exceeds {MAX_POOL_KEYS}",
                self.max_keys, self.ttl_scalar
            )));
        }
        if !(0.0..=1.0).contains(&self.unconfirmed_retry_ratio) {
            return Err(RatchetError::InvalidParams(format!(
                "unconfirmed_retry_ratio must be within [0, 1], got {}",
                self.unconfirmed_retry_ratio
            )));
        }
        Ok(())
    }

    /// Subset used by key budget derivation.
    pub fn ttl_params(&self) -> TtlParams {
        TtlParams { ttl_scalar: self.ttl_scalar, min_num_keys: self.min_num_keys }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(SessionParams::default().validate().is_ok());
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        let params = SessionParams { min_keys: 100, max_keys: 50, ..SessionParams::default() };

        assert!(matches!(params.validate(), Err(RatchetError::InvalidParams(_))));
    }

    #[test]
    fn reserve_must_fit_in_pool() {
        let params = SessionParams {
            min_keys: 100,
            max_keys: 200,
            num_rekeys: 100,
            ..SessionParams::default()
        };

        assert!(matches!(params.validate(), Err(RatchetError::InvalidParams(_))));
    }

    #[test]
    fn retry_ratio_is_a_probability() {
        let params = SessionParams { unconfirmed_retry_ratio: 1.5, ..SessionParams::default() };

        assert!(params.validate().is_err());
    }

    #[test]
    fn oversized_pool_is_rejected() {
        let huge = SessionParams { max_keys: u32::MAX, ..SessionParams::default() };
        let scaled = SessionParams { ttl_scalar: 1e9, ..SessionParams::default() };
        let floor = SessionParams { min_num_keys: u32::MAX, ..SessionParams::default() };

        assert!(matches!(huge.validate(), Err(RatchetError::InvalidParams(_))));
        assert!(matches!(scaled.validate(), Err(RatchetError::InvalidParams(_))));
        assert!(matches!(floor.validate(), Err(RatchetError::InvalidParams(_))));
    }

    #[test]
    fn largest_pool_is_accepted() {
        let params = SessionParams {
            min_keys: MAX_POOL_KEYS - 1,
            max_keys: MAX_POOL_KEYS,
            num_rekeys: 128,
            ttl_scalar: 1.0,
            min_num_keys: MAX_POOL_KEYS,
            unconfirmed_retry_ratio: 0.0,
        };

        assert!(params.validate().is_ok());
    }
}
