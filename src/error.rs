// =============================================================================
// Error taxonomy
// =============================================================================
//
// The engine never terminates on transient or per-order errors. Only two
// classes abort startup: missing configuration and an unrecoverable initial
// authentication. Everything else is retried, surfaced as an execution
// report, or dropped with a log entry.
// =============================================================================

use thiserror::Error;

/// Fatal startup problems. These map to a non-zero exit code.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no ARS/USD instrument pairs discovered")]
    NoPairs,

    #[error("missing credentials for environment '{0}'")]
    MissingCredentials(String),
}

/// Failures on the wire layer.
#[derive(Debug, Error)]
pub enum WireError {
    /// Credential rejection. Terminal for the initial `run()`; swallowed and
    /// retried inside the reconnect loop afterwards.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Any transport fault during REST or streaming. Recovered locally via
    /// backoff + reconnect + resubscribe.
    #[error("transport error: {0}")]
    Transport(anyhow::Error),
}

impl From<anyhow::Error> for WireError {
    fn from(e: anyhow::Error) -> Self {
        Self::Transport(e)
    }
}

impl WireError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}
