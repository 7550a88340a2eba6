//! Predictive delay: skips backend round trips whose outcome is already
//! provably known from a prior synchronized response.
//!
//! Token counts only grow through refill and only shrink through
//! consumption, so a rejection observed with a refill wait of T stays
//! valid for any identical-or-smaller request until T elapses: other
//! distributed consumers can make tokens scarcer, never manufacture them
//! ahead of schedule. A success, conversely, is never predictable
//! locally, because concurrent consumers may have drained the bucket
//! since the last observation. The predictor therefore only ever serves
//! cached rejections; everything else is forwarded and refreshes the
//! cache.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use crate::bucket::{Command, CommandOutcome, CommandResult};
use crate::clock::Clock;
use crate::config::DelayParameters;
use crate::error::Result;

use super::listener::{NoopListener, OptimizationListener};
use super::{AsyncCommandExecutor, CommandExecutor};

/// Last synchronized observation for one key.
#[derive(Debug, Clone)]
struct PredictionEntry {
    outcome: CommandOutcome,
    /// Tokens the rejected request asked for; smaller requests are
    /// covered by the same rejection.
    rejected_tokens: u64,
    /// When refill alone would satisfy the rejected request.
    refill_ready_nanos: u64,
    /// Hard expiry: refill bound capped by the configured staleness
    /// ceiling. The entry is only trusted strictly before this instant.
    valid_until_nanos: u64,
}

/// Shared prediction state and bookkeeping for both executor flavors.
struct Predictor {
    params: DelayParameters,
    clock: Arc<dyn Clock>,
    entries: DashMap<String, PredictionEntry>,
    listener: Arc<dyn OptimizationListener>,
}

impl Predictor {
    fn new(params: DelayParameters, clock: Arc<dyn Clock>) -> Self {
        Self {
            params,
            clock,
            entries: DashMap::new(),
            listener: Arc::new(NoopListener),
        }
    }

    /// Answer from the cache if the command is a consumption covered by a
    /// still-valid rejection.
    fn predict(&self, key: &str, command: &Command) -> Option<CommandResult> {
        let requested = command.consumed_tokens()?;
        let entry = self.entries.get(key)?;
        let now = self.clock.now_nanos();

        if now >= entry.valid_until_nanos || requested > entry.rejected_tokens {
            return None;
        }

        trace!(key = %key, requested, "Serving cached rejection");
        self.listener.call_skipped();
        let mut outcome = entry.outcome.clone();
        outcome.nanos_to_wait = entry.refill_ready_nanos.saturating_sub(now);
        Some(CommandResult::single(outcome))
    }

    /// Refresh the cache from a real backend response.
    ///
    /// `observed_at` is taken before the round trip: the reported wait is
    /// measured from the backend's application time, which can only be
    /// later, so the cached window never overestimates validity.
    fn record(&self, key: &str, command: &Command, result: &CommandResult, observed_at: u64) {
        let rejection = command.consumed_tokens().and_then(|requested| {
            let outcome = result.outcomes.first()?;
            (!outcome.success).then(|| (requested, outcome.clone()))
        });

        match rejection {
            Some((rejected_tokens, outcome)) => {
                let refill_ready = observed_at.saturating_add(outcome.nanos_to_wait);
                let valid_until = observed_at.saturating_add(
                    outcome.nanos_to_wait.min(self.params.max_unsynchronized_nanos),
                );
                self.entries.insert(
                    key.to_string(),
                    PredictionEntry {
                        outcome,
                        rejected_tokens,
                        refill_ready_nanos: refill_ready,
                        valid_until_nanos: valid_until,
                    },
                );
            }
            // A success, or any non-consumption response, proves nothing
            // about future rejections; drop the stale entry.
            None => {
                self.entries.remove(key);
            }
        }
    }

    /// A failed round trip leaves the key unsynchronized; no stale cache
    /// survives a failure.
    fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }
}

/// Delay decorator over an asynchronous executor.
pub struct AsyncDelayedExecutor<E> {
    inner: E,
    predictor: Predictor,
}

impl<E: AsyncCommandExecutor> AsyncDelayedExecutor<E> {
    /// Wrap `inner` with rejection prediction.
    pub fn new(inner: E, params: DelayParameters, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner,
            predictor: Predictor::new(params, clock),
        }
    }

    /// Attach an optimization listener.
    pub fn with_listener(mut self, listener: Arc<dyn OptimizationListener>) -> Self {
        self.predictor.listener = listener;
        self
    }
}

#[async_trait]
impl<E: AsyncCommandExecutor> AsyncCommandExecutor for AsyncDelayedExecutor<E> {
    async fn execute(&self, key: &str, command: Command) -> Result<CommandResult> {
        if let Some(result) = self.predictor.predict(key, &command) {
            return Ok(result);
        }

        self.predictor.listener.call_forwarded();
        let observed_at = self.predictor.clock.now_nanos();
        match self.inner.execute(key, command.clone()).await {
            Ok(result) => {
                self.predictor.record(key, &command, &result, observed_at);
                Ok(result)
            }
            Err(error) => {
                self.predictor.invalidate(key);
                Err(error)
            }
        }
    }
}

/// Delay decorator over a synchronous executor.
pub struct DelayedExecutor<E> {
    inner: E,
    predictor: Predictor,
}

impl<E: CommandExecutor> DelayedExecutor<E> {
    /// Wrap `inner` with rejection prediction.
    pub fn new(inner: E, params: DelayParameters, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner,
            predictor: Predictor::new(params, clock),
        }
    }

    /// Attach an optimization listener.
    pub fn with_listener(mut self, listener: Arc<dyn OptimizationListener>) -> Self {
        self.predictor.listener = listener;
        self
    }
}

impl<E: CommandExecutor> CommandExecutor for DelayedExecutor<E> {
    fn execute(&self, key: &str, command: Command) -> Result<CommandResult> {
        if let Some(result) = self.predictor.predict(key, &command) {
            return Ok(result);
        }

        self.predictor.listener.call_forwarded();
        let observed_at = self.predictor.clock.now_nanos();
        match self.inner.execute(key, command.clone()) {
            Ok(result) => {
                self.predictor.record(key, &command, &result, observed_at);
                Ok(result)
            }
            Err(error) => {
                self.predictor.invalidate(key);
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{Bandwidth, BucketConfig, RetryPolicy};
    use crate::error::FloodgateError;
    use crate::executor::CountingListener;
    use crate::remote::{BackendExecutor, InMemoryBackend};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::time::Duration;

    const MILLI: u64 = 1_000_000;
    const SECOND: u64 = 1_000_000_000;

    struct CountingExecutor<E> {
        inner: E,
        calls: AtomicU64,
        fail_next: AtomicBool,
    }

    impl<E> CountingExecutor<E> {
        fn new(inner: E) -> Self {
            Self {
                inner,
                calls: AtomicU64::new(0),
                fail_next: AtomicBool::new(false),
            }
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl<E: AsyncCommandExecutor> AsyncCommandExecutor for CountingExecutor<E> {
        async fn execute(&self, key: &str, command: Command) -> Result<CommandResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(FloodgateError::Transport("backend down".to_string()));
            }
            self.inner.execute(key, command).await
        }
    }

    fn test_config() -> BucketConfig {
        BucketConfig::single(Bandwidth::simple(10, Duration::from_secs(1))).unwrap()
    }

    fn delayed(
        clock: Arc<ManualClock>,
        params: DelayParameters,
    ) -> (
        Arc<CountingExecutor<BackendExecutor<InMemoryBackend>>>,
        AsyncDelayedExecutor<Arc<CountingExecutor<BackendExecutor<InMemoryBackend>>>>,
    ) {
        let base = BackendExecutor::new(InMemoryBackend::new(), test_config(), clock.clone())
            .with_retry_policy(RetryPolicy::no_backoff(8));
        let counting = Arc::new(CountingExecutor::new(base));
        let executor = AsyncDelayedExecutor::new(counting.clone(), params, clock);
        (counting, executor)
    }

    fn default_params() -> DelayParameters {
        DelayParameters::new(Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_cached_rejection_served_without_backend_call() {
        let clock = ManualClock::starting_at(0);
        let (counting, executor) = delayed(clock.clone(), default_params());

        // Drain the bucket, then observe a rejection: 5 tokens at
        // 10 tokens/s is a 500ms wait.
        executor.execute("k", Command::consume(10)).await.unwrap();
        let result = executor.execute("k", Command::consume(5)).await.unwrap();
        assert!(!result.outcome().success);
        assert_eq!(result.outcome().nanos_to_wait, 500 * MILLI);
        assert_eq!(counting.calls(), 2);

        // At t=200ms an identical-or-smaller request is answered locally
        // with the remaining wait.
        clock.set(200 * MILLI);
        let result = executor.execute("k", Command::consume(1)).await.unwrap();
        assert!(!result.outcome().success);
        assert_eq!(result.outcome().nanos_to_wait, 300 * MILLI);
        assert_eq!(counting.calls(), 2);

        // At t=600ms the wait has elapsed; the request forwards and
        // succeeds against the refilled bucket.
        clock.set(600 * MILLI);
        let result = executor.execute("k", Command::consume(1)).await.unwrap();
        assert!(result.outcome().success);
        assert_eq!(counting.calls(), 3);
    }

    #[tokio::test]
    async fn test_prediction_boundary_is_exact() {
        let clock = ManualClock::starting_at(0);
        let (counting, executor) = delayed(clock.clone(), default_params());

        executor.execute("k", Command::consume(10)).await.unwrap();
        let result = executor.execute("k", Command::consume(1)).await.unwrap();
        let wait = result.outcome().nanos_to_wait;
        assert_eq!(wait, 100 * MILLI);

        // One nanosecond before expiry: still served locally.
        clock.set(wait - 1);
        executor.execute("k", Command::consume(1)).await.unwrap();
        assert_eq!(counting.calls(), 2);

        // At expiry: must resynchronize.
        clock.set(wait);
        executor.execute("k", Command::consume(1)).await.unwrap();
        assert_eq!(counting.calls(), 3);
    }

    #[tokio::test]
    async fn test_larger_request_is_not_covered() {
        let clock = ManualClock::starting_at(0);
        let (counting, executor) = delayed(clock.clone(), default_params());

        executor.execute("k", Command::consume(10)).await.unwrap();
        executor.execute("k", Command::consume(2)).await.unwrap();
        assert_eq!(counting.calls(), 2);

        // A rejection for 2 tokens says nothing about 3.
        let result = executor.execute("k", Command::consume(3)).await.unwrap();
        assert!(!result.outcome().success);
        assert_eq!(counting.calls(), 3);
    }

    #[tokio::test]
    async fn test_success_is_never_predicted() {
        let clock = ManualClock::starting_at(0);
        let (counting, executor) = delayed(clock.clone(), default_params());

        for _ in 0..5 {
            let result = executor.execute("k", Command::consume(1)).await.unwrap();
            assert!(result.outcome().success);
        }
        // Every success consulted the backend.
        assert_eq!(counting.calls(), 5);
    }

    #[tokio::test]
    async fn test_staleness_ceiling_forces_resync() {
        let clock = ManualClock::starting_at(0);
        let (counting, executor) = delayed(
            clock.clone(),
            DelayParameters::new(Duration::from_millis(100)),
        );

        executor.execute("k", Command::consume(10)).await.unwrap();
        let result = executor.execute("k", Command::consume(5)).await.unwrap();
        // The refill bound alone would hold for 500ms.
        assert_eq!(result.outcome().nanos_to_wait, 500 * MILLI);

        // Within the ceiling: cached.
        clock.set(50 * MILLI);
        executor.execute("k", Command::consume(5)).await.unwrap();
        assert_eq!(counting.calls(), 2);

        // Past the ceiling the rejection would still mathematically
        // hold, but staleness is bounded and we resynchronize.
        clock.set(200 * MILLI);
        executor.execute("k", Command::consume(5)).await.unwrap();
        assert_eq!(counting.calls(), 3);
    }

    #[tokio::test]
    async fn test_forwarded_error_clears_cache_and_propagates() {
        let clock = ManualClock::starting_at(0);
        let (counting, executor) = delayed(clock.clone(), default_params());

        executor.execute("k", Command::consume(10)).await.unwrap();
        executor.execute("k", Command::consume(5)).await.unwrap();
        assert_eq!(counting.calls(), 2);

        // A forwarded call fails: the error reaches the caller and the
        // key is left unsynchronized.
        counting.fail_next.store(true, Ordering::SeqCst);
        let err = executor
            .execute("k", Command::add_tokens(1))
            .await
            .unwrap_err();
        assert_eq!(err, FloodgateError::Transport("backend down".to_string()));

        // The previously cached rejection is gone, so this forwards.
        clock.set(100 * MILLI);
        executor.execute("k", Command::consume(5)).await.unwrap();
        assert_eq!(counting.calls(), 4);
    }

    #[tokio::test]
    async fn test_non_consumption_commands_always_forward() {
        let clock = ManualClock::starting_at(0);
        let (counting, executor) = delayed(clock.clone(), default_params());

        executor.execute("k", Command::consume(10)).await.unwrap();
        executor.execute("k", Command::consume(5)).await.unwrap();
        assert_eq!(counting.calls(), 2);

        // Reads and resets bypass the cache even while a rejection is
        // valid, and a compound is never served locally.
        executor.execute("k", Command::GetAvailableTokens).await.unwrap();
        assert_eq!(counting.calls(), 3);
        executor
            .execute("k", Command::compound(vec![Command::consume(1)]))
            .await
            .unwrap();
        assert_eq!(counting.calls(), 4);
    }

    #[tokio::test]
    async fn test_keys_have_independent_predictions() {
        let clock = ManualClock::starting_at(0);
        let (counting, executor) = delayed(clock.clone(), default_params());

        executor.execute("a", Command::consume(10)).await.unwrap();
        executor.execute("a", Command::consume(1)).await.unwrap();
        assert_eq!(counting.calls(), 2);

        // Key B has no cached state; it must forward.
        let result = executor.execute("b", Command::consume(1)).await.unwrap();
        assert!(result.outcome().success);
        assert_eq!(counting.calls(), 3);
    }

    #[tokio::test]
    async fn test_listener_counts_skips_and_forwards() {
        let clock = ManualClock::starting_at(0);
        let listener = Arc::new(CountingListener::new());
        let base = BackendExecutor::new(InMemoryBackend::new(), test_config(), clock.clone())
            .with_retry_policy(RetryPolicy::no_backoff(8));
        let executor = AsyncDelayedExecutor::new(base, default_params(), clock.clone())
            .with_listener(listener.clone());

        executor.execute("k", Command::consume(10)).await.unwrap();
        executor.execute("k", Command::consume(5)).await.unwrap();
        clock.set(100 * MILLI);
        executor.execute("k", Command::consume(5)).await.unwrap();

        assert_eq!(listener.forwarded(), 2);
        assert_eq!(listener.skipped(), 1);
    }

    #[test]
    fn test_sync_delayed_executor_serves_cached_rejection() {
        use crate::bucket::{apply, BucketState};
        use parking_lot::Mutex;
        use std::collections::HashMap;

        struct LocalExecutor {
            config: BucketConfig,
            clock: Arc<ManualClock>,
            states: Mutex<HashMap<String, BucketState>>,
            calls: AtomicU64,
        }

        impl CommandExecutor for LocalExecutor {
            fn execute(&self, key: &str, command: Command) -> Result<CommandResult> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let now = self.clock.now_nanos();
                let mut states = self.states.lock();
                let state = states
                    .entry(key.to_string())
                    .or_insert_with(|| BucketState::initial(&self.config, now));
                let (next, result) = apply(&self.config, state, &command, now);
                *state = next;
                Ok(result)
            }
        }

        let clock = ManualClock::starting_at(0);
        let local = Arc::new(LocalExecutor {
            config: test_config(),
            clock: clock.clone(),
            states: Mutex::new(HashMap::new()),
            calls: AtomicU64::new(0),
        });

        let executor = DelayedExecutor::new(local.clone(), default_params(), clock.clone());

        executor.execute("k", Command::consume(10)).unwrap();
        let result = executor.execute("k", Command::consume(5)).unwrap();
        assert!(!result.outcome().success);
        assert_eq!(local.calls.load(Ordering::SeqCst), 2);

        clock.set(200 * MILLI);
        let result = executor.execute("k", Command::consume(5)).unwrap();
        assert!(!result.outcome().success);
        assert_eq!(result.outcome().nanos_to_wait, 300 * MILLI);
        assert_eq!(local.calls.load(Ordering::SeqCst), 2);

        clock.set(SECOND);
        let result = executor.execute("k", Command::consume(5)).unwrap();
        assert!(result.outcome().success);
        assert_eq!(local.calls.load(Ordering::SeqCst), 3);
    }
}
