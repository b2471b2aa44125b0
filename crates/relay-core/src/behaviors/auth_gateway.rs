//! Gateway handshake verification (ingress side)
//!
//! A gateway ingress sends `welcome` with nonce N1; the outward peer
//! replies `authgateway` with its own nonce N2 and `H(PSK, N1, N2)`. This
//! behavior recomputes the hash and, on match, promotes the stream to
//! `GatewayAuth`. Subsequent frames stay PlainText: payloads crossing a
//! gateway are already wrapped end-to-end between the true endpoints.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::info;

use strand_protocol::{Envelope, GatewayAuthPayload};

use crate::context::RelayContext;
use crate::error::{RelayError, Result};
use crate::socket::SocketState;
use crate::state::ConnectionState;

/// Gateway peers carry no tenant; this marker satisfies the non-empty
/// identity invariant for `GatewayAuth` streams.
pub(crate) const GATEWAY_TENANT: &str = "gateway";

/// HMAC-SHA256 over both handshake nonces, keyed by the pre-shared key
pub(crate) fn gateway_hash(psk: &str, welcome_nonce: &[u8], reply_nonce: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(psk.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(welcome_nonce);
    mac.update(reply_nonce);
    mac.finalize().into_bytes().to_vec()
}

pub(crate) async fn run(
    ctx: Arc<RelayContext>,
    socket: Arc<SocketState>,
    envelope: Envelope,
) -> Result<()> {
    if socket.state() != ConnectionState::GatewayUnauth {
        return Err(RelayError::policy(
            "Gateway handshake on a non-gateway stream",
        ));
    }
    let psk = ctx
        .config
        .gateway
        .pre_shared_key
        .as_deref()
        .ok_or_else(|| RelayError::policy("Gateway pre-shared key not configured"))?;
    let welcome_nonce = socket
        .handshake_nonce()
        .ok_or_else(|| RelayError::policy("No gateway handshake in progress"))?;

    let payload: GatewayAuthPayload = envelope
        .parse_payload()
        .map_err(|_| RelayError::policy("Invalid gateway handshake payload"))?;
    let reply_nonce = B64
        .decode(&payload.nonce)
        .map_err(|_| RelayError::policy("Invalid gateway handshake payload"))?;
    let presented = B64
        .decode(&payload.hash)
        .map_err(|_| RelayError::policy("Invalid gateway handshake payload"))?;

    let expected = gateway_hash(psk, &welcome_nonce, &reply_nonce);
    if expected.ct_eq(presented.as_slice()).unwrap_u8() != 1 {
        return Err(RelayError::policy("Incorrect gateway handshake"));
    }

    let peer = envelope
        .from
        .as_deref()
        .filter(|f| !f.is_empty())
        .ok_or_else(|| RelayError::policy("Gateway handshake without a peer id"))?;
    socket.assign_peer_id(peer, GATEWAY_TENANT)?;
    socket.set_state(ConnectionState::GatewayAuth);

    info!(
        peer = %peer,
        connection_id = %socket.connection_id(),
        "gateway peer authenticated"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_node, RecordingSink};
    use strand_config::NodeRole;
    use strand_protocol::MessageType;

    fn gateway_socket(nonce: Option<&[u8]>) -> Arc<SocketState> {
        let socket = SocketState::new(
            ConnectionState::GatewayUnauth,
            Box::new(RecordingSink::new()),
            None,
        );
        if let Some(n) = nonce {
            socket.set_handshake_nonce(n.to_vec());
        }
        socket
    }

    fn handshake_envelope(psk: &str, n1: &[u8], n2: &[u8]) -> Envelope {
        Envelope::new(MessageType::AuthGateway)
            .from_id("service-1")
            .with_payload(&GatewayAuthPayload {
                nonce: B64.encode(n2),
                hash: B64.encode(gateway_hash(psk, n1, n2)),
            })
            .unwrap()
    }

    #[tokio::test]
    async fn correct_hash_promotes_to_gateway_auth() {
        let node = test_node(NodeRole::Gateway, "gw-1");
        let n1 = [7u8; 32];
        let socket = gateway_socket(Some(&n1));

        let env = handshake_envelope("test-psk", &n1, &[9u8; 32]);
        run(node.ctx.clone(), socket.clone(), env).await.unwrap();

        assert_eq!(socket.state(), ConnectionState::GatewayAuth);
        assert_eq!(socket.client_id().as_deref(), Some("service-1"));
    }

    #[tokio::test]
    async fn wrong_psk_fails_handshake() {
        let node = test_node(NodeRole::Gateway, "gw-1");
        let n1 = [7u8; 32];
        let socket = gateway_socket(Some(&n1));

        let env = handshake_envelope("wrong-psk", &n1, &[9u8; 32]);
        let err = run(node.ctx.clone(), socket.clone(), env)
            .await
            .unwrap_err();
        assert!(err.is_policy_violation());
        assert_eq!(socket.state(), ConnectionState::GatewayUnauth);
    }

    #[tokio::test]
    async fn handshake_without_welcome_nonce_fails() {
        let node = test_node(NodeRole::Gateway, "gw-1");
        let socket = gateway_socket(None);
        let env = handshake_envelope("test-psk", &[7u8; 32], &[9u8; 32]);
        assert!(run(node.ctx.clone(), socket, env).await.is_err());
    }

    #[tokio::test]
    async fn handshake_on_authenticated_stream_is_rejected() {
        let node = test_node(NodeRole::Gateway, "gw-1");
        let n1 = [7u8; 32];
        let socket = gateway_socket(Some(&n1));
        socket.set_state(ConnectionState::GatewayAuth);
        let env = handshake_envelope("test-psk", &n1, &[9u8; 32]);
        assert!(run(node.ctx.clone(), socket, env).await.is_err());
    }

    #[tokio::test]
    async fn full_two_node_handshake() {
        // Gateway ingress sends welcome, service side answers, ingress verifies
        let gateway = test_node(NodeRole::Gateway, "gw-1");
        let service = test_node(NodeRole::Service, "svc-1");

        let ingress = gateway_socket(None);
        crate::behaviors::welcome::send_welcome(&gateway.ctx, &ingress)
            .await
            .unwrap();
        let n1 = ingress.handshake_nonce().unwrap();

        // Outward side receives the welcome and produces the reply
        let outward_sink = RecordingSink::new();
        let outward = SocketState::new(
            ConnectionState::GatewayUnauth,
            Box::new(outward_sink.clone()),
            None,
        );
        let welcome = Envelope::new(MessageType::Welcome)
            .from_id("gw-1")
            .with_payload(&strand_protocol::WelcomePayload {
                public_key_hash: "h".into(),
                machine_name: "gw-1".into(),
                server_version: "0".into(),
                nonce: Some(B64.encode(&n1)),
                allowed_protocol_versions: vec![1],
            })
            .unwrap();
        crate::behaviors::welcome::run(service.ctx.clone(), outward.clone(), welcome)
            .await
            .unwrap();
        assert_eq!(outward.state(), ConnectionState::GatewayAuth);

        // The reply it produced satisfies the verifier
        let reply = outward_sink.sent_envelopes().pop().unwrap();
        run(gateway.ctx.clone(), ingress.clone(), reply)
            .await
            .unwrap();
        assert_eq!(ingress.state(), ConnectionState::GatewayAuth);
        assert_eq!(ingress.client_id().as_deref(), Some("svc-1"));
    }
}
