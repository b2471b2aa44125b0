//! Agent control responses
//!
//! An agent answers a relayed control request with a `control` envelope.
//! If the request originated here, the pending correlation completes; if it
//! was proxied in from another node, the response is wrapped back toward
//! the gateway peer that recently showed interest in this agent.

use std::sync::Arc;

use tracing::{debug, warn};

use strand_protocol::{ControlResponse, Envelope, MessageType, ProxyPayload};

use crate::context::RelayContext;
use crate::error::{RelayError, Result};
use crate::pending::PendingKey;
use crate::socket::{Seal, SocketState};
use crate::state::ConnectionState;

pub(crate) async fn run(
    ctx: Arc<RelayContext>,
    socket: Arc<SocketState>,
    envelope: Envelope,
) -> Result<()> {
    if socket.state() != ConnectionState::AgentAuth {
        return Err(RelayError::policy("Control requires an authenticated agent"));
    }
    let organization_id = socket
        .organization_id()
        .ok_or_else(|| RelayError::policy("Control on a stream without a tenant"))?;
    let client_id = socket
        .client_id()
        .ok_or_else(|| RelayError::policy("Control on a stream without an identity"))?;

    let response: ControlResponse = envelope.parse_payload()?;
    let Some(message_id) = envelope.message_id.clone() else {
        debug!(client_id = %client_id, "control response without a message id, ignoring");
        return Ok(());
    };

    let key = PendingKey::new(&organization_id, &client_id, &message_id);
    if ctx.pending.complete(&key, response) {
        return Ok(());
    }

    // Not ours: relay back along the recent-interest return path
    let relevant = ctx
        .directory
        .gateways_relevant_to(&organization_id, &client_id);
    if relevant.is_empty() {
        debug!(
            client_id = %client_id,
            message_id = %message_id,
            "control response matched no pending request and no gateway interest"
        );
        return Ok(());
    }
    for gateway in relevant {
        let proxy = ProxyPayload {
            kind: MessageType::Control,
            from: client_id.clone(),
            to: envelope.to.clone().unwrap_or_default(),
            organization_id: organization_id.clone(),
            inner_message: envelope.payload.clone(),
        };
        let outer = Envelope::new(MessageType::Proxy)
            .from_id(ctx.instance_id())
            .to_id(gateway.client_id().unwrap_or_default())
            .with_message_id(message_id.clone())
            .with_payload(&proxy)?;
        if let Err(e) = gateway.send(&outer, Seal::Plain).await {
            warn!(error = %e, "control return-path relay failed");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_node, RecordingSink};
    use std::time::Duration;
    use strand_config::NodeRole;

    fn agent(org: &str, id: &str) -> (Arc<SocketState>, RecordingSink) {
        let sink = RecordingSink::new();
        let socket = SocketState::new(ConnectionState::AgentAuth, Box::new(sink.clone()), None);
        socket.assign_identity(id, org, None, None).unwrap();
        (socket, sink)
    }

    fn control_envelope(from: &str, message_id: &str) -> Envelope {
        Envelope::new(MessageType::Control)
            .from_id(from)
            .with_message_id(message_id)
            .with_payload(&ControlResponse {
                success: true,
                output: Some(serde_json::json!({"uptime": 42})),
                message: None,
            })
            .unwrap()
    }

    #[tokio::test]
    async fn completes_local_pending_response() {
        let node = test_node(NodeRole::Service, "svc-1");
        let ticket = node.ctx.pending.prepare(
            PendingKey::new("T1", "A1", "m-ctl"),
            Duration::from_secs(5),
        );
        let (socket, _) = agent("T1", "A1");

        run(node.ctx.clone(), socket, control_envelope("A1", "m-ctl"))
            .await
            .unwrap();

        match ticket.wait().await {
            crate::pending::PendingOutcome::Completed(resp) => {
                assert!(resp.success);
                assert_eq!(resp.output.unwrap()["uptime"], 42);
            }
            crate::pending::PendingOutcome::TimedOut => panic!("expected completion"),
        }
    }

    #[tokio::test]
    async fn unmatched_response_relays_to_interested_gateway() {
        let node = test_node(NodeRole::Gateway, "gw-1");
        let gateway_sink = RecordingSink::new();
        let gateway = SocketState::new(
            ConnectionState::GatewayAuth,
            Box::new(gateway_sink.clone()),
            None,
        );
        gateway.assign_peer_id("svc-1", "gateway").unwrap();
        gateway.interest().mark("T1", "A1");
        node.ctx.directory.add_gateway(gateway);
        let (socket, _) = agent("T1", "A1");

        run(node.ctx.clone(), socket, control_envelope("A1", "m-ctl"))
            .await
            .unwrap();

        let outer = gateway_sink.sent_envelopes().pop().unwrap();
        assert_eq!(outer.kind, MessageType::Proxy);
        assert_eq!(outer.message_id.as_deref(), Some("m-ctl"));
        let proxy: ProxyPayload = outer.parse_payload().unwrap();
        assert_eq!(proxy.kind, MessageType::Control);
        assert_eq!(proxy.from, "A1");
        assert_eq!(proxy.organization_id, "T1");
    }

    #[tokio::test]
    async fn uninterested_gateway_sees_nothing() {
        let node = test_node(NodeRole::Gateway, "gw-1");
        let gateway_sink = RecordingSink::new();
        let gateway = SocketState::new(
            ConnectionState::GatewayAuth,
            Box::new(gateway_sink.clone()),
            None,
        );
        gateway.assign_peer_id("svc-1", "gateway").unwrap();
        node.ctx.directory.add_gateway(gateway);
        let (socket, _) = agent("T1", "A1");

        run(node.ctx.clone(), socket, control_envelope("A1", "m-ctl"))
            .await
            .unwrap();
        assert!(gateway_sink.sent().is_empty());
    }

    #[tokio::test]
    async fn control_from_portal_is_policy_violation() {
        let node = test_node(NodeRole::Service, "svc-1");
        let socket = SocketState::new(
            ConnectionState::PortalAuth,
            Box::new(RecordingSink::new()),
            None,
        );
        socket.assign_identity("P1", "T1", None, None).unwrap();
        let err = run(node.ctx.clone(), socket, control_envelope("P1", "m"))
            .await
            .unwrap_err();
        assert!(err.is_policy_violation());
    }
}
