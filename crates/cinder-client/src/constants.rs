//! Client runtime constants.
//!
//! Tiger Style: every retry loop and timer in the runtime is bounded by one
//! of these values.

use std::time::Duration;

/// Initial delay of the default backoff strategy.
pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_millis(300);

/// Upper bound on any delay produced by the default backoff strategy.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(10);

/// Jitter bound of the default backoff strategy, in counter steps.
pub const DEFAULT_BACKOFF_RANDOM: u32 = 1;

/// Largest exponent applied by the exponential backoff.
///
/// Tiger Style: caps `2^counter` so the multiplication cannot overflow.
pub const MAX_BACKOFF_EXPONENT: u32 = 30;

/// Shortest lease TTL the client accepts, in seconds.
pub const MIN_LEASE_TTL_SECS: i64 = 1;

/// Keep-alives are sent this many times per TTL.
pub const KEEPALIVES_PER_TTL: u32 = 3;

/// Default number of times a conflicting software transaction is retried.
pub const DEFAULT_STM_RETRIES: u32 = 3;

/// Default TTL of the lease backing a lock, in seconds.
pub const DEFAULT_LOCK_TTL_SECS: i64 = 30;

/// Number of silent retries after the store rejects the auth token.
pub const MAX_AUTH_RETRIES: u32 = 1;

/// Environment variable prefix used by [`crate::ClientOptions::from_env`].
pub const ENV_PREFIX: &str = "CINDER_";
