//! Process-local backend implementing the full capability contract.
//!
//! Useful on its own for single-process deployments and as the reference
//! backend in tests. The scripting capability is optional at construction
//! time so both protocol branches can be exercised against the same store.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use crate::bucket::{apply, BucketState, Command, CommandResult};
use crate::config::BucketConfig;
use crate::error::Result;
use crate::remote::protocol::VersionedState;

use super::backend::{ScriptBackend, StateBackend};

#[derive(Debug, Clone)]
struct StoredEntry {
    version: u64,
    bytes: Vec<u8>,
}

/// An in-memory key-value backend with compare-and-swap semantics.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    entries: DashMap<String, StoredEntry>,
    scripting_enabled: bool,
}

impl InMemoryBackend {
    /// Create a backend offering only the compare-and-swap primitive.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend that additionally advertises server-side atomic
    /// execution.
    pub fn with_scripting() -> Self {
        Self {
            entries: DashMap::new(),
            scripting_enabled: true,
        }
    }

    /// Stored version for a key, if present. Primarily useful in tests.
    pub fn version(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|e| e.version)
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the backend holds no state.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl StateBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|e| e.bytes.clone()))
    }

    async fn conditional_update(
        &self,
        key: &str,
        expected_version: u64,
        new_bytes: Vec<u8>,
    ) -> Result<bool> {
        let accepted = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().version == expected_version {
                    occupied.insert(StoredEntry {
                        version: expected_version + 1,
                        bytes: new_bytes,
                    });
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                if expected_version == 0 {
                    vacant.insert(StoredEntry {
                        version: 1,
                        bytes: new_bytes,
                    });
                    true
                } else {
                    false
                }
            }
        };
        trace!(key = %key, expected_version, accepted, "Conditional update");
        Ok(accepted)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn scripting(&self) -> Option<&dyn ScriptBackend> {
        if self.scripting_enabled {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl ScriptBackend for InMemoryBackend {
    async fn execute_atomic(
        &self,
        key: &str,
        config: &BucketConfig,
        command: &Command,
        now_nanos: u64,
    ) -> Result<CommandResult> {
        // The entry guard makes the whole fetch-apply-store step atomic
        // for this key; apply() is pure, so nothing here awaits.
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let stored = VersionedState::decode(key, &occupied.get().bytes)?;
                let (next, result) = apply(config, &stored.state, command, now_nanos);
                let new = VersionedState {
                    version: stored.version + 1,
                    state: next,
                };
                occupied.insert(StoredEntry {
                    version: new.version,
                    bytes: new.encode()?,
                });
                Ok(result)
            }
            Entry::Vacant(vacant) => {
                let initial = BucketState::initial(config, now_nanos);
                let (next, result) = apply(config, &initial, command, now_nanos);
                let new = VersionedState {
                    version: 1,
                    state: next,
                };
                vacant.insert(StoredEntry {
                    version: 1,
                    bytes: new.encode()?,
                });
                Ok(result.mark_state_created())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_absent_key() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_conditional_update_insert_and_replace() {
        let backend = InMemoryBackend::new();

        // Insert requires an expected version of zero.
        assert!(backend
            .conditional_update("k", 0, b"one".to_vec())
            .await
            .unwrap());
        assert!(!backend
            .conditional_update("k", 0, b"dup".to_vec())
            .await
            .unwrap());
        assert_eq!(backend.version("k"), Some(1));

        // Replace requires the current version.
        assert!(backend
            .conditional_update("k", 1, b"two".to_vec())
            .await
            .unwrap());
        assert!(!backend
            .conditional_update("k", 1, b"stale".to_vec())
            .await
            .unwrap());
        assert_eq!(backend.version("k"), Some(2));
        assert_eq!(backend.get("k").await.unwrap(), Some(b"two".to_vec()));
    }

    #[tokio::test]
    async fn test_delete_removes_state() {
        let backend = InMemoryBackend::new();
        backend
            .conditional_update("k", 0, b"v".to_vec())
            .await
            .unwrap();

        backend.delete("k").await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert!(backend.is_empty());

        // Reinsertion starts over at version 1.
        assert!(backend
            .conditional_update("k", 0, b"v".to_vec())
            .await
            .unwrap());
        assert_eq!(backend.version("k"), Some(1));
    }

    #[test]
    fn test_scripting_capability_flag() {
        assert!(InMemoryBackend::new().scripting().is_none());
        assert!(InMemoryBackend::with_scripting().scripting().is_some());
    }
}
