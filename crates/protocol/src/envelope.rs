//! Envelope and payload types for the Strand relay protocol
//!
//! Every frame on the wire is one [`Envelope`] serialized as JSON and then
//! sealed with one of the transport wrappings in [`crate::sealing`]. The
//! `payload` field is itself a serialized JSON document whose shape depends
//! on the envelope `type`; the typed payload structs in this module mirror
//! those shapes.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ProtocolError, Result};

/// Envelope types carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Welcome,
    AuthPortal,
    Auth,
    AuthGateway,
    Ping,
    Pong,
    List,
    Command,
    Control,
    Proxy,
    Warning,
    /// Absent or unrecognized type; no behavior handles it
    #[serde(other)]
    Unknown,
}

impl Default for MessageType {
    fn default() -> Self {
        MessageType::Unknown
    }
}

impl MessageType {
    /// Wire name of this message type
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Welcome => "welcome",
            MessageType::AuthPortal => "authportal",
            MessageType::Auth => "auth",
            MessageType::AuthGateway => "authgateway",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::List => "list",
            MessageType::Command => "command",
            MessageType::Control => "control",
            MessageType::Proxy => "proxy",
            MessageType::Warning => "warning",
            MessageType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client categories tracked by the fabric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientKind {
    Agent,
    Portal,
    Gateway,
    Unknown,
}

impl std::fmt::Display for ClientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientKind::Agent => f.write_str("Agent"),
            ClientKind::Portal => f.write_str("Portal"),
            ClientKind::Gateway => f.write_str("Gateway"),
            ClientKind::Unknown => f.write_str("Unknown"),
        }
    }
}

/// The on-wire message envelope
///
/// All identifier fields are free-form strings; `"unknown"` is used by
/// clients that have not yet been assigned an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: MessageType,
    /// Correlation token; required for request/reply types
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Serialized inner payload, interpretation depends on `kind`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    /// Set on failure responses; mutually exclusive with a success payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Envelope {
    /// Create an envelope of the given type with a fresh message id
    pub fn new(kind: MessageType) -> Self {
        Self {
            from: None,
            to: None,
            kind,
            message_id: Some(Uuid::new_v4().to_string()),
            payload: None,
            error_message: None,
        }
    }

    /// Set the sender identifier
    pub fn from_id(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Set the recipient identifier
    pub fn to_id(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    /// Carry over an existing correlation token
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Serialize `payload` into the envelope
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self> {
        self.payload = Some(serde_json::to_string(payload)?);
        Ok(self)
    }

    /// Set a raw, already-serialized payload
    pub fn with_raw_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Mark the envelope as a failure response
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Deserialize the payload as `T`
    ///
    /// An absent payload and a payload that does not parse as `T` are both
    /// reported as [`ProtocolError::InvalidPayload`].
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T> {
        let raw = self.payload.as_deref().ok_or_else(|| {
            ProtocolError::invalid_payload(self.kind.as_str(), "payload is empty")
        })?;
        serde_json::from_str(raw)
            .map_err(|e| ProtocolError::invalid_payload(self.kind.as_str(), e.to_string()))
    }

    /// Serialize the envelope to its JSON wire form
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse an envelope from its JSON wire form
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))
    }
}

/// `authportal` request payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalAuthRequest {
    pub token: String,
    #[serde(default)]
    pub client_version: Option<String>,
    #[serde(default)]
    pub protocol_version: Option<u32>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// `auth` (agent) request payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentAuthRequest {
    pub token: String,
    /// PEM-encoded public key the node will encrypt to after authentication
    pub public_key: String,
    #[serde(default)]
    pub client_version: Option<String>,
    #[serde(default)]
    pub protocol_version: Option<u32>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Result payload for `authportal` and `auth` replies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResult {
    pub accepted: bool,
    pub will_replace_token: bool,
    #[serde(default)]
    pub new_token: Option<String>,
}

impl AuthResult {
    /// A plain acceptance with no token rotation
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            will_replace_token: false,
            new_token: None,
        }
    }

    /// A rejection
    pub fn rejected() -> Self {
        Self {
            accepted: false,
            will_replace_token: false,
            new_token: None,
        }
    }
}

/// `authgateway` payload: the second pass of the pre-shared-key handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAuthPayload {
    /// Responder nonce (base64)
    pub nonce: String,
    /// base64 HMAC over the welcome nonce and the responder nonce
    pub hash: String,
}

/// `welcome` payload sent on every accepted stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomePayload {
    pub public_key_hash: String,
    pub machine_name: String,
    pub server_version: String,
    /// Fresh handshake nonce; only present on gateway ingress
    #[serde(default)]
    pub nonce: Option<String>,
    pub allowed_protocol_versions: Vec<u32>,
}

/// Inner envelope carried between Service and Gateway nodes inside a `proxy`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyPayload {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub from: String,
    pub to: String,
    pub organization_id: String,
    /// Payload of the original request; absent for list pushes
    #[serde(default)]
    pub inner_message: Option<String>,
}

/// Control request relayed from the backend to an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlRequest {
    pub command: String,
    #[serde(default)]
    pub settings: Option<serde_json::Value>,
}

/// Control response produced by an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlResponse {
    pub success: bool,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub message: Option<String>,
}

/// A registered client as stored in the tenant registry and returned by `list`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRegistration {
    pub client_id: String,
    pub organization_id: String,
    #[serde(rename = "type")]
    pub kind: ClientKind,
    #[serde(default)]
    pub machine_registration_id: Option<String>,
    #[serde(default)]
    pub client_version: Option<String>,
    /// Instance id of the node terminating this client
    #[serde(default)]
    pub gateway_id: Option<String>,
    pub last_updated_on: chrono::DateTime<chrono::Utc>,
}
