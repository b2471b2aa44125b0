//! Error types for the Strand protocol

use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The wire bytes do not form a valid envelope for the expected wrapping
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Signature verification or decryption failed.
    ///
    /// This variant is deliberately uniform over all cryptographic failure
    /// modes so that a peer cannot distinguish a bad signature from a bad
    /// ciphertext.
    #[error("Invalid connection state for authentication")]
    InvalidConnectionStateForAuthentication,

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Invalid public key material
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Invalid private key material
    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    CryptoError(String),

    /// Envelope failed variant-specific validation
    #[error("Invalid payload for {kind}: {message}")]
    InvalidPayload { kind: String, message: String },
}

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::SerializationError(err.to_string())
    }
}

impl ProtocolError {
    /// Create an invalid payload error
    pub fn invalid_payload(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            kind: kind.into(),
            message: message.into(),
        }
    }
}
