//! Operational errors.

use thiserror::Error;

use crate::proto::ProtoError;

/// Errors surfaced by the agent core.
///
/// During message dispatch most of these collapse into a wire-level
/// `SSH_AGENT_FAILURE`; the session stays open. [`InvalidState`]
/// (`AgentError::InvalidState`) indicates a misused API and is fatal to the
/// offending session.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Wire-level encode/decode failure.
    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),

    /// A sign or lookup request targeted a key not in the store.
    #[error("key not found")]
    NotFound,

    /// A destination constraint, binding failure, session-id mismatch or
    /// user refusal denied the operation.
    #[error("denied: {0}")]
    Denied(String),

    /// Lock/unlock called in the wrong state, or concurrent suspendable
    /// operations on one session.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Unlock attempted inside the brute-force back-off window.
    #[error("too many failed unlock attempts, wait {remaining} seconds before retrying")]
    Throttled {
        /// Seconds until unlock attempts are accepted again.
        remaining: u64,
    },

    /// Signature verification, key decryption or passphrase check failed.
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// Transport-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    pub(crate) fn denied(msg: impl Into<String>) -> Self {
        Self::Denied(msg.into())
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub(crate) fn crypto(msg: impl std::fmt::Display) -> Self {
        Self::Crypto(msg.to_string())
    }
}

/// Result alias for agent operations.
pub type AgentResult<T> = std::result::Result<T, AgentError>;
