//! Ports onto external collaborators
//!
//! Token validation and the message bus live behind narrow trait interfaces
//! so the engine never depends on a concrete backend. All collaborators are
//! constructed at startup and injected; nothing reaches back into the
//! behaviors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::Result;

/// Outcome of validating a portal or agent token
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenValidation {
    pub success: bool,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub registered_agent_id: Option<String>,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub new_token: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    /// Set by the authenticator for impersonated portal sessions
    #[serde(default)]
    pub impersonated: bool,
}

impl TokenValidation {
    /// A rejection carrying a reason
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            organization_id: None,
            registered_agent_id: None,
            expires: None,
            new_token: None,
            message: Some(message.into()),
            impersonated: false,
        }
    }
}

/// The request/reply token validation backend
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Validate a portal connect token
    async fn validate_portal_token(&self, token: &str) -> Result<TokenValidation>;

    /// Validate an agent request token
    async fn validate_agent_token(&self, token: &str) -> Result<TokenValidation>;
}

/// Lifecycle events published for agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentActivityType {
    Connected,
    Ping,
    Disconnected,
}

/// Activity event published on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentActivityMessage {
    pub activity_type: AgentActivityType,
    pub connected_on: DateTime<Utc>,
    #[serde(default)]
    pub registered_agent_id: Option<String>,
    pub organization_id: String,
    #[serde(default)]
    pub client_version: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Periodic public key announcement
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyAnnouncement {
    pub hash: String,
    pub pem: String,
    pub instance_name: String,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

/// Agent-control request arriving from the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentControlCommandRequest {
    pub agent_id: String,
    pub organization_id: String,
    pub command: String,
    #[serde(default)]
    pub settings: Option<serde_json::Value>,
}

/// Response returned to the backend; always sent, even on failure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentControlCommandResponse {
    pub agent_id: String,
    pub organization_id: String,
    #[serde(default)]
    pub settings: Option<serde_json::Value>,
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// One agent-control conversation from the bus
///
/// The transport keeps the reply channel; dropping it without sending is a
/// protocol violation of the intake contract (responses are mandatory).
/// Responses placed on the bus carry a one-minute TTL.
#[derive(Debug)]
pub struct BusControlRequest {
    pub request: AgentControlCommandRequest,
    pub reply: oneshot::Sender<AgentControlCommandResponse>,
}

/// Publish side of the message bus
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an agent lifecycle event; best-effort
    async fn publish_activity(&self, message: AgentActivityMessage) -> Result<()>;

    /// Publish the node's public key; best-effort, on a schedule
    async fn publish_public_key(&self, announcement: PublicKeyAnnouncement) -> Result<()>;
}

/// A bus that publishes nothing; used when the bus is disabled
pub struct NullEventBus;

#[async_trait]
impl EventBus for NullEventBus {
    async fn publish_activity(&self, _message: AgentActivityMessage) -> Result<()> {
        Ok(())
    }

    async fn publish_public_key(&self, _announcement: PublicKeyAnnouncement) -> Result<()> {
        Ok(())
    }
}
