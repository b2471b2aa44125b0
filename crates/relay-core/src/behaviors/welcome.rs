//! The `welcome` envelope
//!
//! Every ingress stream receives a PlainText `welcome` immediately after
//! attach, carrying this node's public-key fingerprint, instance name and
//! allowed protocol versions; gateway ingress adds a fresh handshake nonce.
//! On the outward side of a gateway connection, receiving the `welcome` is
//! what starts the handshake reply.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use rand::RngCore;
use tracing::info;

use strand_protocol::{
    Envelope, GatewayAuthPayload, MessageType, WelcomePayload, GATEWAY_NONCE_LEN,
};

use crate::behaviors::auth_gateway::{gateway_hash, GATEWAY_TENANT};
use crate::context::RelayContext;
use crate::error::{RelayError, Result};
use crate::socket::{Seal, SocketState};
use crate::state::ConnectionState;

/// Send the ingress `welcome`; gateway ingress gets a handshake nonce
pub(crate) async fn send_welcome(ctx: &Arc<RelayContext>, socket: &Arc<SocketState>) -> Result<()> {
    let mut payload = WelcomePayload {
        public_key_hash: ctx.keys.fingerprint().to_string(),
        machine_name: ctx.instance_id().to_string(),
        server_version: RelayContext::server_version().to_string(),
        nonce: None,
        allowed_protocol_versions: ctx.allowed_protocol_versions(),
    };
    if socket.state() == ConnectionState::GatewayUnauth {
        let mut nonce = [0u8; GATEWAY_NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        socket.set_handshake_nonce(nonce.to_vec());
        payload.nonce = Some(B64.encode(nonce));
    }

    let envelope = Envelope::new(MessageType::Welcome)
        .from_id(ctx.instance_id())
        .with_payload(&payload)?;
    socket.send(&envelope, Seal::Plain).await
}

/// Handle a `welcome` received on an outward gateway connection
pub(crate) async fn run(
    ctx: Arc<RelayContext>,
    socket: Arc<SocketState>,
    envelope: Envelope,
) -> Result<()> {
    if socket.state() != ConnectionState::GatewayUnauth {
        return Err(RelayError::policy("Unexpected welcome"));
    }
    let psk = ctx
        .config
        .gateway
        .pre_shared_key
        .as_deref()
        .ok_or_else(|| RelayError::policy("Gateway pre-shared key not configured"))?;

    let payload: WelcomePayload = envelope
        .parse_payload()
        .map_err(|_| RelayError::policy("Invalid welcome payload"))?;
    let welcome_nonce = payload
        .nonce
        .as_deref()
        .ok_or_else(|| RelayError::policy("Gateway welcome carried no nonce"))?;
    let welcome_nonce = B64
        .decode(welcome_nonce)
        .map_err(|_| RelayError::policy("Invalid welcome payload"))?;

    let peer = envelope
        .from
        .as_deref()
        .filter(|f| !f.is_empty())
        .ok_or_else(|| RelayError::policy("Gateway welcome without a peer id"))?;

    let mut reply_nonce = [0u8; GATEWAY_NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut reply_nonce);
    let hash = gateway_hash(psk, &welcome_nonce, &reply_nonce);

    let reply = Envelope::new(MessageType::AuthGateway)
        .from_id(ctx.instance_id())
        .to_id(peer)
        .with_payload(&GatewayAuthPayload {
            nonce: B64.encode(reply_nonce),
            hash: B64.encode(hash),
        })?;

    socket.assign_peer_id(peer, GATEWAY_TENANT)?;
    socket.send(&reply, Seal::Plain).await?;
    socket.set_state(ConnectionState::GatewayAuth);

    info!(
        peer = %peer,
        connection_id = %socket.connection_id(),
        "outward gateway connection authenticated"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_node, RecordingSink};
    use strand_config::NodeRole;

    #[tokio::test]
    async fn welcome_on_gateway_ingress_carries_nonce() {
        let node = test_node(NodeRole::Gateway, "gw-1");
        let sink = RecordingSink::new();
        let socket = SocketState::new(
            ConnectionState::GatewayUnauth,
            Box::new(sink.clone()),
            None,
        );
        send_welcome(&node.ctx, &socket).await.unwrap();

        let envelopes = sink.sent_envelopes();
        assert_eq!(envelopes.len(), 1);
        let payload: WelcomePayload = envelopes[0].parse_payload().unwrap();
        assert!(payload.nonce.is_some());
        assert_eq!(payload.machine_name, "gw-1");
        assert_eq!(payload.allowed_protocol_versions, vec![1]);
        assert!(socket.handshake_nonce().is_some());
    }

    #[tokio::test]
    async fn welcome_on_portal_ingress_has_no_nonce() {
        let node = test_node(NodeRole::Service, "svc-1");
        let sink = RecordingSink::new();
        let socket = SocketState::new(
            ConnectionState::PortalUnauth,
            Box::new(sink.clone()),
            None,
        );
        send_welcome(&node.ctx, &socket).await.unwrap();

        let payload: WelcomePayload = sink.sent_envelopes()[0].parse_payload().unwrap();
        assert!(payload.nonce.is_none());
        assert!(socket.handshake_nonce().is_none());
    }

    #[tokio::test]
    async fn welcome_without_nonce_fails_outward_handshake() {
        let node = test_node(NodeRole::Service, "svc-1");
        let socket = SocketState::new(
            ConnectionState::GatewayUnauth,
            Box::new(RecordingSink::new()),
            None,
        );
        let welcome = Envelope::new(MessageType::Welcome)
            .from_id("gw-1")
            .with_payload(&WelcomePayload {
                public_key_hash: "h".into(),
                machine_name: "gw-1".into(),
                server_version: "0".into(),
                nonce: None,
                allowed_protocol_versions: vec![1],
            })
            .unwrap();
        let err = run(node.ctx.clone(), socket, welcome).await.unwrap_err();
        assert!(err.is_policy_violation());
    }
}
