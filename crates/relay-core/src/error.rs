//! Relay engine error types

use thiserror::Error;

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors raised while relaying
#[derive(Error, Debug)]
pub enum RelayError {
    /// Protocol violation; closes the offending stream with code 1008
    #[error("Policy violation: {reason}")]
    PolicyViolation { reason: String },

    /// Target client not attached and not reachable via any gateway
    #[error("Not found: {0}")]
    NotFound(String),

    /// A bus request or relayed response missed its deadline
    #[error("Timed out: {0}")]
    BusTimeout(String),

    /// Frame transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Tenant registry failure
    #[error("Registry error: {0}")]
    Registry(String),

    /// Message bus failure
    #[error("Bus error: {0}")]
    Bus(String),

    /// Envelope or wrapping failure from the protocol layer
    #[error("Protocol error: {0}")]
    Protocol(#[from] strand_protocol::ProtocolError),

    /// Node is shutting down
    #[error("Shutting down")]
    Shutdown,
}

impl RelayError {
    /// Create a policy violation
    pub fn policy(reason: impl Into<String>) -> Self {
        Self::PolicyViolation {
            reason: reason.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Create a registry error
    pub fn registry(message: impl Into<String>) -> Self {
        Self::Registry(message.into())
    }

    /// True when this error must close the stream it occurred on
    pub fn is_policy_violation(&self) -> bool {
        matches!(self, Self::PolicyViolation { .. })
    }
}
