//! Backend capability contract consumed by the versioned state protocol.

use async_trait::async_trait;

use crate::bucket::{Command, CommandResult};
use crate::config::BucketConfig;
use crate::error::Result;

/// A remote key-value store holding serialized versioned bucket state.
///
/// Every backend must offer the compare-and-swap primitive; scripting-capable
/// backends additionally expose [`ScriptBackend`] through [`scripting`],
/// letting the protocol hand the whole fetch-apply-store sequence to the
/// backend as one atomic step. The protocol branches on which capability is
/// present, not on a type hierarchy.
///
/// [`scripting`]: StateBackend::scripting
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Fetch the opaque serialized state for a key, if present.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Conditionally replace the state for a key.
    ///
    /// The write is accepted only if the stored version still matches
    /// `expected_version`; an expected version of zero requires the key to
    /// be absent. Returns whether the write was accepted.
    async fn conditional_update(
        &self,
        key: &str,
        expected_version: u64,
        new_bytes: Vec<u8>,
    ) -> Result<bool>;

    /// Remove all persisted state for a key. Subsequent access
    /// reinitializes the bucket from its configuration.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Server-side atomic execution capability, when the backend has one.
    fn scripting(&self) -> Option<&dyn ScriptBackend> {
        None
    }
}

/// Server-side atomic execution of a bucket command.
///
/// The backend runs the same pure state machine internally and guarantees
/// the fetch-apply-store sequence is atomic, so no client-side retry loop
/// is needed.
#[async_trait]
pub trait ScriptBackend: Send + Sync {
    /// Atomically apply `command` to the state stored under `key`,
    /// initializing absent state from `config`, and persist the successor
    /// state. Outcomes carry `state_created` when the key was absent.
    async fn execute_atomic(
        &self,
        key: &str,
        config: &BucketConfig,
        command: &Command,
        now_nanos: u64,
    ) -> Result<CommandResult>;
}
