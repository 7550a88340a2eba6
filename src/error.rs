//! Error types for floodgate operations.

use thiserror::Error;

/// Main error type for distributed bucket operations.
///
/// The type is `Clone` because a single failed backend round trip may need
/// to be delivered to every request waiting on the same in-flight batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FloodgateError {
    /// The backend is unreachable or returned a fault.
    #[error("Backend transport error: {0}")]
    Transport(String),

    /// The compare-and-swap loop exceeded its retry bound.
    ///
    /// Distinct from `Transport` so callers can tell "backend down" apart
    /// from "too much write contention on this key".
    #[error("Write contention exhausted for key '{key}' after {attempts} attempts")]
    ContentionExhausted {
        /// The contended bucket key.
        key: String,
        /// Number of compare-and-swap attempts made before giving up.
        attempts: u32,
    },

    /// A stored value could not be decoded into a versioned bucket state.
    ///
    /// Corrupted state is surfaced rather than silently reinitialized;
    /// reinitialization only happens for a genuinely absent key.
    #[error("Corrupted state for key '{key}': {reason}")]
    CorruptedState {
        /// The affected bucket key.
        key: String,
        /// Decode failure detail.
        reason: String,
    },

    /// State could not be serialized for transport.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid bucket or optimization configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
