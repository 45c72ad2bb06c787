//! Error types for the watchdog core.

use thiserror::Error;

/// Errors surfaced by the detection and healing core.
#[derive(Error, Debug)]
pub enum WatchdogError {
    /// The dedup store could not be consulted. Callers fail closed.
    #[error("Dedup store unavailable: {0}")]
    StoreUnavailable(String),

    /// A different remediation is already attached to this key.
    #[error("Remediation {existing} already active for {key}")]
    RemediationConflict { key: String, existing: String },

    /// A bounded collaborator call did not finish in time.
    #[error("{operation} timed out after {secs} seconds")]
    Timeout { operation: &'static str, secs: u64 },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Raw watch payload could not be turned into an event.
    #[error("Malformed event: {0}")]
    MalformedEvent(String),
}

/// Result alias used across the core.
pub type Result<T, E = WatchdogError> = std::result::Result<T, E>;
