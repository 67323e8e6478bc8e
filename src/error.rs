// src/error.rs

use std::path::PathBuf;
use std::time::Duration;

/// Boxed error returned by external collaborators (SDK client constructors,
/// upstream token producers).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, RotationError>;

/// Every failure path in the rotation subsystem. None of them is fatal to the
/// process: callers degrade toward the last known-good credential or client.
#[derive(Debug, thiserror::Error)]
pub enum RotationError {
    /// The Secret watch could not be started (no in-cluster config, RBAC, ...).
    #[error("secret feed unavailable: {0}")]
    FeedUnavailable(String),

    #[error("failed to mirror secret payload to {path}: {source}")]
    MirrorWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("credential derivation failed: {0}")]
    Derivation(String),

    #[error("token fetch failed: {0}")]
    TokenFetch(#[source] BoxError),

    #[error("client `{client}` could not be built: {source}")]
    ClientBuild {
        client: String,
        #[source]
        source: BoxError,
    },

    #[error("replacement cancelled while {in_flight} borrower(s) still held the client")]
    DrainCancelled { in_flight: usize },

    #[error("replacement timed out after {timeout:?} waiting for borrowers to release")]
    DrainTimeout { timeout: Duration },

    #[error("client handle has not been initialized yet")]
    NotInitialized,

    #[error("invalid configuration: {0}")]
    Config(String),
}
