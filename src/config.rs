//! Bucket and optimization configuration types.
//!
//! These types are consumed by the execution pipeline; they are plain data
//! with validation, not a builder surface.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{FloodgateError, Result};

/// A single capacity-plus-refill-rate limit.
///
/// A bucket may enforce several bandwidths simultaneously; the number of
/// tokens available for consumption at any instant is the minimum across
/// all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bandwidth {
    /// Maximum tokens the bandwidth can hold.
    pub capacity: u64,
    /// Tokens added per refill period.
    pub refill_tokens: u64,
    /// Refill period in nanoseconds.
    pub refill_period_nanos: u64,
    /// Tokens available when the bucket is first created.
    pub initial_tokens: u64,
}

impl Bandwidth {
    /// Create a bandwidth refilling `refill_tokens` every `period`,
    /// starting full.
    pub fn new(capacity: u64, refill_tokens: u64, period: Duration) -> Self {
        Self {
            capacity,
            refill_tokens,
            refill_period_nanos: period.as_nanos() as u64,
            initial_tokens: capacity,
        }
    }

    /// Create a bandwidth that regenerates its full capacity every `period`.
    pub fn simple(capacity: u64, period: Duration) -> Self {
        Self::new(capacity, capacity, period)
    }

    /// Override the number of tokens the bucket starts with.
    pub fn with_initial_tokens(mut self, initial_tokens: u64) -> Self {
        self.initial_tokens = initial_tokens;
        self
    }

    /// Validate this bandwidth.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(FloodgateError::Config(
                "bandwidth capacity must be positive".to_string(),
            ));
        }
        if self.refill_tokens == 0 {
            return Err(FloodgateError::Config(
                "bandwidth refill tokens must be positive".to_string(),
            ));
        }
        if self.refill_period_nanos == 0 {
            return Err(FloodgateError::Config(
                "bandwidth refill period must be positive".to_string(),
            ));
        }
        if self.initial_tokens > self.capacity {
            return Err(FloodgateError::Config(format!(
                "initial tokens {} exceed capacity {}",
                self.initial_tokens, self.capacity
            )));
        }
        Ok(())
    }
}

/// Complete configuration for one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// The limits enforced by this bucket, all simultaneously.
    pub bandwidths: Vec<Bandwidth>,
}

impl BucketConfig {
    /// Create a configuration from a list of bandwidths.
    pub fn new(bandwidths: Vec<Bandwidth>) -> Result<Self> {
        let config = Self { bandwidths };
        config.validate()?;
        Ok(config)
    }

    /// Convenience constructor for a single-bandwidth bucket.
    pub fn single(bandwidth: Bandwidth) -> Result<Self> {
        Self::new(vec![bandwidth])
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.bandwidths.is_empty() {
            return Err(FloodgateError::Config(
                "bucket requires at least one bandwidth".to_string(),
            ));
        }
        for bandwidth in &self.bandwidths {
            bandwidth.validate()?;
        }
        Ok(())
    }
}

/// Retry behavior for the optimistic compare-and-swap loop.
///
/// The bound and backoff schedule are operational tuning parameters, so
/// they are configurable rather than hard-coded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum compare-and-swap attempts before giving up with a
    /// contention error.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base backoff between attempts, scaled linearly per attempt.
    #[serde(default = "default_backoff")]
    pub backoff: Duration,
    /// Upper bound of random jitter added to each backoff.
    #[serde(default = "default_jitter")]
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: default_backoff(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// A policy that retries without sleeping, useful in tests.
    pub fn no_backoff(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }
}

fn default_max_attempts() -> u32 {
    8
}

fn default_backoff() -> Duration {
    Duration::from_millis(1)
}

fn default_jitter() -> Duration {
    Duration::from_millis(1)
}

/// Parameters for the predictive delay optimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayParameters {
    /// Hard ceiling on how long a cached rejection may be served without
    /// resynchronizing, independent of the bucket's own refill schedule.
    /// Bounds staleness under clock drift or misconfiguration.
    pub max_unsynchronized_nanos: u64,
}

impl DelayParameters {
    /// Create delay parameters with the given staleness ceiling.
    pub fn new(max_unsynchronized: Duration) -> Self {
        Self {
            max_unsynchronized_nanos: max_unsynchronized.as_nanos() as u64,
        }
    }

    /// Validate the parameters.
    pub fn validate(&self) -> Result<()> {
        if self.max_unsynchronized_nanos == 0 {
            return Err(FloodgateError::Config(
                "max unsynchronized window must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
