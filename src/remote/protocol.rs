//! Versioned remote state protocol.
//!
//! Applies a command to the state stored for one key atomically, either by
//! handing the whole step to a scripting-capable backend or by running a
//! bounded optimistic compare-and-swap loop. Both paths expose the same
//! executor contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::bucket::{apply, BucketState, Command, CommandResult};
use crate::clock::Clock;
use crate::config::{BucketConfig, RetryPolicy};
use crate::error::{FloodgateError, Result};
use crate::executor::AsyncCommandExecutor;

use super::backend::StateBackend;

/// What is actually persisted in the backend for a key.
///
/// The version changes on every accepted write and is the sole
/// concurrency-control token; no locks are held across the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedState {
    /// Strictly increasing write counter, starting at 1 on creation.
    pub version: u64,
    /// The bucket state proper.
    pub state: BucketState,
}

impl VersionedState {
    /// Serialize for storage.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| FloodgateError::Serialization(e.to_string()))
    }

    /// Deserialize a stored value.
    ///
    /// A value that does not decode is corrupted state, never a reason to
    /// reinitialize.
    pub fn decode(key: &str, bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| FloodgateError::CorruptedState {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}

/// The base executor: applies commands against a [`StateBackend`].
///
/// Selects the atomicity strategy by backend capability: server-side
/// atomic execution when the backend offers it, otherwise the optimistic
/// compare-and-swap loop.
pub struct BackendExecutor<B> {
    backend: B,
    config: BucketConfig,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl<B: StateBackend> BackendExecutor<B> {
    /// Create an executor for buckets configured with `config`.
    pub fn new(backend: B, config: BucketConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            config,
            clock,
            retry: RetryPolicy::default(),
        }
    }

    /// Override the compare-and-swap retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The bucket configuration this executor applies.
    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    /// Access the underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Remove all persisted state for a key; the next access
    /// reinitializes the bucket from its configuration.
    pub async fn delete(&self, key: &str) -> Result<()> {
        debug!(key = %key, "Deleting bucket state");
        self.backend.delete(key).await
    }

    async fn execute_cas(&self, key: &str, command: &Command) -> Result<CommandResult> {
        for attempt in 1..=self.retry.max_attempts {
            let now = self.clock.now_nanos();

            let (prior, observed_version, created) = match self.backend.get(key).await? {
                Some(bytes) => {
                    let stored = VersionedState::decode(key, &bytes)?;
                    (stored.state, stored.version, false)
                }
                None => (BucketState::initial(&self.config, now), 0, true),
            };

            let (next, result) = apply(&self.config, &prior, command, now);
            let new_bytes = VersionedState {
                version: observed_version + 1,
                state: next,
            }
            .encode()?;

            if self
                .backend
                .conditional_update(key, observed_version, new_bytes)
                .await?
            {
                trace!(key = %key, attempt, version = observed_version + 1, "State written");
                return Ok(if created {
                    debug!(key = %key, "Initialized bucket state");
                    result.mark_state_created()
                } else {
                    result
                });
            }

            debug!(key = %key, attempt, "Conditional update rejected, retrying");
            if attempt < self.retry.max_attempts {
                self.backoff(attempt).await;
            }
        }

        Err(FloodgateError::ContentionExhausted {
            key: key.to_string(),
            attempts: self.retry.max_attempts,
        })
    }

    async fn backoff(&self, attempt: u32) {
        let base = self.retry.backoff.saturating_mul(attempt);
        let jitter_nanos = self.retry.jitter.as_nanos() as u64;
        let jitter = if jitter_nanos == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(rand::thread_rng().gen_range(0..=jitter_nanos))
        };
        let delay = base + jitter;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl<B: StateBackend> AsyncCommandExecutor for BackendExecutor<B> {
    async fn execute(&self, key: &str, command: Command) -> Result<CommandResult> {
        if let Some(script) = self.backend.scripting() {
            let now = self.clock.now_nanos();
            trace!(key = %key, "Executing via server-side atomic script");
            return script
                .execute_atomic(key, &self.config, &command, now)
                .await;
        }
        self.execute_cas(key, &command).await
    }
}
