//! Command executor contracts and optimization decorators.
//!
//! Backend adapters implement [`AsyncCommandExecutor`] (or
//! [`CommandExecutor`] for blocking callers) at the leaf; everything else
//! in the pipeline is written purely in terms of these traits, so the
//! batching and delay decorators can wrap any executor, including each
//! other, in any combination.

mod batching;
mod delay;
mod listener;

pub use batching::{AsyncBatchingExecutor, BatchingExecutor};
pub use delay::{AsyncDelayedExecutor, DelayedExecutor};
pub use listener::{CountingListener, NoopListener, OptimizationListener};

use async_trait::async_trait;
use tokio::runtime::Handle;

use crate::bucket::{Command, CommandResult};
use crate::error::Result;

/// Synchronous command execution contract.
///
/// `execute` blocks the calling thread until the backend round trip (or
/// retry sequence) completes or fails.
pub trait CommandExecutor: Send + Sync {
    /// Apply `command` to the bucket stored under `key`.
    fn execute(&self, key: &str, command: Command) -> Result<CommandResult>;
}

/// Asynchronous command execution contract.
///
/// Never blocks the caller; failures complete the future with an error
/// instead of a result.
#[async_trait]
pub trait AsyncCommandExecutor: Send + Sync {
    /// Apply `command` to the bucket stored under `key`.
    async fn execute(&self, key: &str, command: Command) -> Result<CommandResult>;
}

impl<E: CommandExecutor + ?Sized> CommandExecutor for std::sync::Arc<E> {
    fn execute(&self, key: &str, command: Command) -> Result<CommandResult> {
        (**self).execute(key, command)
    }
}

#[async_trait]
impl<E: AsyncCommandExecutor + ?Sized> AsyncCommandExecutor for std::sync::Arc<E> {
    async fn execute(&self, key: &str, command: Command) -> Result<CommandResult> {
        (**self).execute(key, command).await
    }
}

/// Adapter exposing an async executor through the synchronous contract.
///
/// Must be called from outside the captured runtime; calling `execute`
/// on a runtime worker thread panics in tokio.
pub struct BlockingExecutor<E> {
    inner: E,
    handle: Handle,
}

impl<E: AsyncCommandExecutor> BlockingExecutor<E> {
    /// Wrap `inner`, driving it on the given runtime handle.
    pub fn new(inner: E, handle: Handle) -> Self {
        Self { inner, handle }
    }
}

impl<E: AsyncCommandExecutor> CommandExecutor for BlockingExecutor<E> {
    fn execute(&self, key: &str, command: Command) -> Result<CommandResult> {
        self.handle.block_on(self.inner.execute(key, command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{Bandwidth, BucketConfig};
    use crate::remote::{BackendExecutor, InMemoryBackend};
    use std::time::Duration;

    #[test]
    fn test_blocking_executor_bridges_async_backend() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let base = BackendExecutor::new(
            InMemoryBackend::new(),
            BucketConfig::single(Bandwidth::simple(10, Duration::from_secs(1))).unwrap(),
            ManualClock::starting_at(0),
        );
        let executor = BlockingExecutor::new(base, runtime.handle().clone());

        let result = executor.execute("k", Command::consume(4)).unwrap();
        assert!(result.outcome().success);
        assert_eq!(result.outcome().remaining_tokens, Some(6));

        let result = executor.execute("k", Command::consume(7)).unwrap();
        assert!(!result.outcome().success);
    }
}
