//! Per-stream connection state machine

use strand_protocol::{ClientKind, Wrapping};

/// The lifecycle states of one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Pre-route; nothing is known about the peer
    Unknown,
    /// Route-tagged Portal, not authenticated
    PortalUnauth,
    /// Portal authenticated
    PortalAuth,
    /// Route-tagged Agent, not authenticated
    AgentUnauth,
    /// Agent authenticated
    AgentAuth,
    /// Gateway peer, handshake in progress
    GatewayUnauth,
    /// Gateway peer, handshake done
    GatewayAuth,
}

impl ConnectionState {
    /// The wrapping inbound frames must carry in this state
    pub fn expected_wrapping(&self) -> Wrapping {
        match self {
            ConnectionState::AgentUnauth => Wrapping::SignOnly,
            ConnectionState::AgentAuth => Wrapping::Encrypt,
            _ => Wrapping::PlainText,
        }
    }

    /// True once the handshake for this stream has completed
    pub fn is_authenticated(&self) -> bool {
        matches!(
            self,
            ConnectionState::PortalAuth | ConnectionState::AgentAuth | ConnectionState::GatewayAuth
        )
    }

    /// The client category this state implies
    pub fn client_kind(&self) -> ClientKind {
        match self {
            ConnectionState::PortalUnauth | ConnectionState::PortalAuth => ClientKind::Portal,
            ConnectionState::AgentUnauth | ConnectionState::AgentAuth => ClientKind::Agent,
            ConnectionState::GatewayUnauth | ConnectionState::GatewayAuth => ClientKind::Gateway,
            ConnectionState::Unknown => ClientKind::Unknown,
        }
    }
}
