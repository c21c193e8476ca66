//! Typed error taxonomy shared across every component (spec §7).
//!
//! Every fallible operation in this crate returns a concrete [`Error`].
//! Panics are reserved for invariant breaches in internal code, never for
//! user input or subprocess behavior.

use crate::types::TunnelId;

/// The single error type returned by all public, fallible operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A value type constructor failed its invariants.
    #[error("validation failed: {0}")]
    Validation(String),

    /// §4.4 exhausted its search without finding an executable agent binary.
    #[error("frpc binary not found; searched: {}", searched.join(", "))]
    BinaryNotFound { searched: Vec<String> },

    /// Supervisor start failed for a reason other than auth/port-in-use.
    #[error("agent process failed to start: {0}")]
    Connection(String),

    /// The agent's output matched the authentication-failure pattern.
    #[error("agent authentication failed: {0}")]
    Authentication(String),

    /// The agent's output matched the address-in-use pattern.
    #[error("agent reported port already in use: {0}")]
    PortInUse(String),

    /// `startup_timeout` elapsed with no readiness and no fatal pattern.
    #[error("agent did not become ready within {0:?}")]
    StartupTimeout(std::time::Duration),

    /// A registry invariant (id, path, remote port) was violated on insert.
    #[error("conflict: {0}")]
    Conflict(String),

    /// An operation was invoked while the subject was in an incompatible state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The registry or a group's capacity was reached.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// One or more closes failed during scoped teardown. Each cause is
    /// tagged with the id of the tunnel whose close failed.
    #[error("cleanup failed for {} resource(s): {}", causes.len(), format_causes(causes))]
    Cleanup { causes: Vec<(TunnelId, Box<Error>)> },

    /// The caller cancelled a long-running operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The facade is in degraded mode after a failed rollback.
    #[error("client is degraded; only disconnect is permitted")]
    Degraded,

    /// Wraps an underlying I/O failure without losing its origin.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wraps a TOML serialization failure from the emitter.
    #[error("TOML emission error: {0}")]
    Toml(#[from] toml::ser::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Builds a [`Error::Cleanup`] from the per-tunnel sub-errors collected
    /// during scoped teardown (spec §4.8, §7). Returns `Ok(())` if `causes`
    /// is empty, since best-effort cleanup that hit no errors is a success.
    pub fn from_cleanup(causes: Vec<(TunnelId, Error)>) -> Result<()> {
        if causes.is_empty() {
            return Ok(());
        }
        Err(Error::Cleanup {
            causes: causes.into_iter().map(|(id, e)| (id, Box::new(e))).collect(),
        })
    }

    /// The per-tunnel sub-errors of a [`Error::Cleanup`], if this is one.
    pub fn cleanup_causes(&self) -> Option<&[(TunnelId, Box<Error>)]> {
        match self {
            Error::Cleanup { causes } => Some(causes),
            _ => None,
        }
    }
}

fn format_causes(causes: &[(TunnelId, Box<Error>)]) -> String {
    causes
        .iter()
        .map(|(id, e)| format!("{id}: {e}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
