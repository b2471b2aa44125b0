//! Strand Protocol Core
//!
//! This crate contains the envelope types, transport wrappings and key
//! material shared by every node role in the Strand relay fabric.

pub mod envelope;
pub mod error;
pub mod keys;
pub mod sealing;

pub use envelope::{
    AgentAuthRequest, AuthResult, ClientKind, ClientRegistration, ControlRequest, ControlResponse,
    Envelope, GatewayAuthPayload, MessageType, PortalAuthRequest, ProxyPayload, WelcomePayload,
};
pub use error::{ProtocolError, Result};
pub use keys::{NodeKeyPair, PeerPublicKey};
pub use sealing::Wrapping;

/// Protocol versions this implementation can speak
pub const SUPPORTED_PROTOCOL_VERSIONS: &[u32] = &[1];

/// Default cumulative byte budget for a stream before authentication
pub const DEFAULT_MAX_BYTES_BEFORE_AUTHENTICATION: usize = 100_000;

/// Default per-frame size cap after authentication
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024; // 1MB

/// Length of the random nonce carried in a gateway `welcome`
pub const GATEWAY_NONCE_LEN: usize = 32;
