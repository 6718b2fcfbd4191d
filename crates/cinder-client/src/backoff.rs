//! Retry delay strategies.
//!
//! Strategies are immutable values: [`BackoffStrategy::next`] and
//! [`BackoffStrategy::reset`] return new instances instead of mutating, so a
//! single baseline can be shared by every pool record and every watch
//! manager.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::DEFAULT_BACKOFF_INITIAL;
use crate::constants::DEFAULT_BACKOFF_MAX;
use crate::constants::DEFAULT_BACKOFF_RANDOM;
use crate::constants::MAX_BACKOFF_EXPONENT;

/// Computes how long to wait before retrying a failed resource.
pub trait BackoffStrategy: fmt::Debug + Send + Sync {
    /// Delay to wait before the next attempt.
    fn delay(&self) -> Duration;

    /// Strategy to use after another failure.
    fn next(&self) -> Arc<dyn BackoffStrategy>;

    /// Strategy to use after a success.
    fn reset(&self) -> Arc<dyn BackoffStrategy>;
}

/// Exponential backoff with bounded random jitter.
///
/// The delay is `min(max, initial * 2^(counter - jitter))` where `jitter` is
/// drawn uniformly from `0..=random` and the exponent never goes below zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    random: u32,
    counter: u32,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, random: u32) -> Self {
        Self {
            initial,
            max,
            random,
            counter: 0,
        }
    }

    /// Number of failures this instance has seen since the last reset.
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// The delay for a given jitter draw.
    pub fn delay_with_jitter(&self, jitter: u32) -> Duration {
        let exponent = self.counter.saturating_sub(jitter).min(MAX_BACKOFF_EXPONENT);
        let factor = 1u32 << exponent;
        self.initial.checked_mul(factor).map_or(self.max, |delay| delay.min(self.max))
    }

    fn advanced(&self) -> Self {
        Self {
            counter: self.counter.saturating_add(1),
            ..*self
        }
    }

    fn rewound(&self) -> Self {
        Self { counter: 0, ..*self }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_INITIAL, DEFAULT_BACKOFF_MAX, DEFAULT_BACKOFF_RANDOM)
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn delay(&self) -> Duration {
        let jitter = if self.random == 0 {
            0
        } else {
            rand::rng().random_range(0..=self.random)
        };
        self.delay_with_jitter(jitter)
    }

    fn next(&self) -> Arc<dyn BackoffStrategy> {
        Arc::new(self.advanced())
    }

    fn reset(&self) -> Arc<dyn BackoffStrategy> {
        Arc::new(self.rewound())
    }
}

/// The strategy used when no override is configured.
pub fn default_strategy() -> Arc<dyn BackoffStrategy> {
    Arc::new(ExponentialBackoff::default())
}
