//! Command relay
//!
//! Portals issue commands to agents; agents send command responses back the
//! same way. Routing order: a gateway peer terminating the target, then a
//! locally-attached target, then a `DestinationNotAvailableForRelay` error
//! back to the sender. A cross-tenant target closes both streams.

use std::sync::Arc;

use tracing::{debug, warn};

use strand_protocol::{ClientKind, ClientRegistration, Envelope, MessageType, ProxyPayload};

use crate::context::RelayContext;
use crate::error::{RelayError, Result};
use crate::socket::{Seal, SocketState};
use crate::state::ConnectionState;
use crate::transport::CloseCode;

const DESTINATION_UNAVAILABLE: &str = "DestinationNotAvailableForRelay";

pub(crate) async fn run(
    ctx: Arc<RelayContext>,
    socket: Arc<SocketState>,
    envelope: Envelope,
) -> Result<()> {
    let state = socket.state();
    if !matches!(
        state,
        ConnectionState::PortalAuth | ConnectionState::AgentAuth
    ) {
        return Err(RelayError::policy(
            "Command requires an authenticated portal or agent",
        ));
    }
    let organization_id = socket
        .organization_id()
        .ok_or_else(|| RelayError::policy("Command on a stream without a tenant"))?;
    let sender = socket
        .client_id()
        .ok_or_else(|| RelayError::policy("Command on a stream without an identity"))?;

    let target = match envelope.to.as_deref().filter(|t| !t.is_empty()) {
        Some(target) => target.to_string(),
        None => {
            reply_unavailable(&ctx, &socket, &envelope).await;
            return Ok(());
        }
    };

    // Cross-tenant targets and impersonated senders take the denial path:
    // both the source and the supposed destination stream go down.
    let foreign = ctx.directory.first_client_where(|s| {
        s.is_authenticated()
            && s.client_id().as_deref() == Some(target.as_str())
            && s.organization_id().as_deref() != Some(organization_id.as_str())
    });
    if socket.impersonated() || foreign.is_some() {
        if let Some(destination) = foreign {
            warn!(
                sender = %sender,
                target = %target,
                "cross-tenant command attempt, closing both streams"
            );
            if let Err(e) = destination
                .close(CloseCode::PolicyViolation, "Access denied")
                .await
            {
                debug!(error = %e, "destination close failed");
            }
        }
        return Err(RelayError::policy("Access denied"));
    }

    let record = lookup_target(&ctx, state, &organization_id, &target).await;
    let Some(record) = record else {
        reply_unavailable(&ctx, &socket, &envelope).await;
        return Ok(());
    };

    // 1. A gateway peer terminates the target: wrap and relay
    if let Some(gateway_id) = record.gateway_id.as_deref() {
        if gateway_id != ctx.instance_id() {
            if let Some(gateway) = ctx.directory.find_gateway(gateway_id) {
                let proxy = ProxyPayload {
                    kind: envelope.kind,
                    from: sender.clone(),
                    to: record.client_id.clone(),
                    organization_id: organization_id.clone(),
                    inner_message: envelope.payload.clone(),
                };
                let mut outer = Envelope::new(MessageType::Proxy)
                    .from_id(ctx.instance_id())
                    .to_id(gateway_id)
                    .with_payload(&proxy)?;
                if let Some(message_id) = &envelope.message_id {
                    outer = outer.with_message_id(message_id.clone());
                }
                gateway.interest().mark(&organization_id, &record.client_id);
                if let Err(e) = gateway.send(&outer, Seal::Plain).await {
                    warn!(error = %e, gateway = %gateway_id, "gateway relay failed");
                    reply_unavailable(&ctx, &socket, &envelope).await;
                }
                return Ok(());
            }
        }
    }

    // 2. Locally attached
    let local = match state {
        ConnectionState::PortalAuth => ctx.directory.find_agent(&organization_id, &target),
        _ => ctx.directory.find_portal(&organization_id, &target),
    };
    if let Some(destination) = local {
        let seal = match destination.kind() {
            ClientKind::Agent => match destination.peer_public_key() {
                Some(key) => Seal::Encrypted(key),
                None => {
                    warn!(target = %target, "agent without a public key");
                    reply_unavailable(&ctx, &socket, &envelope).await;
                    return Ok(());
                }
            },
            _ => Seal::Plain,
        };
        if let Err(e) = destination.send(&envelope, seal).await {
            warn!(error = %e, target = %target, "local forward failed");
            reply_unavailable(&ctx, &socket, &envelope).await;
        }
        return Ok(());
    }

    // 3. Nowhere to go
    reply_unavailable(&ctx, &socket, &envelope).await;
    Ok(())
}

/// Registry lookup for the target, scoped to the sender's tenant
async fn lookup_target(
    ctx: &Arc<RelayContext>,
    sender_state: ConnectionState,
    organization_id: &str,
    target: &str,
) -> Option<ClientRegistration> {
    let rows = match sender_state {
        // Portals command agents; agents respond to portals
        ConnectionState::PortalAuth => ctx.registry.agents(organization_id).await,
        _ => ctx.registry.portals(organization_id).await,
    };
    match rows {
        Ok(rows) => rows.into_iter().find(|r| r.client_id == target),
        Err(e) => {
            warn!(error = %e, "registry lookup failed");
            None
        }
    }
}

/// Tell the sender the destination is unreachable, mirroring the type
async fn reply_unavailable(ctx: &Arc<RelayContext>, socket: &Arc<SocketState>, request: &Envelope) {
    let mut reply = Envelope::new(request.kind)
        .from_id(ctx.instance_id())
        .with_error(DESTINATION_UNAVAILABLE);
    if let Some(from) = &request.from {
        reply = reply.to_id(from.clone());
    }
    if let Some(message_id) = &request.message_id {
        reply = reply.with_message_id(message_id.clone());
    }
    let seal = match socket.kind() {
        ClientKind::Agent => match socket.peer_public_key() {
            Some(key) => Seal::Encrypted(key),
            None => return,
        },
        _ => Seal::Plain,
    };
    if let Err(e) = socket.send(&reply, seal).await {
        warn!(error = %e, "failed to send unavailable reply");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Registration, RegistryStore};
    use crate::testutil::{test_keys, test_node, RecordingSink, TestNode};
    use strand_config::NodeRole;
    use strand_protocol::{sealing, PeerPublicKey};

    fn portal(org: &str, id: &str) -> (Arc<SocketState>, RecordingSink) {
        let sink = RecordingSink::new();
        let socket = SocketState::new(ConnectionState::PortalAuth, Box::new(sink.clone()), None);
        socket.assign_identity(id, org, None, None).unwrap();
        (socket, sink)
    }

    fn agent(org: &str, id: &str) -> (Arc<SocketState>, RecordingSink) {
        let sink = RecordingSink::new();
        let socket = SocketState::new(ConnectionState::AgentAuth, Box::new(sink.clone()), None);
        socket.assign_identity(id, org, None, None).unwrap();
        socket.set_peer_public_key(
            PeerPublicKey::from_pem(&test_keys().public_key_pem().unwrap()).unwrap(),
        );
        (socket, sink)
    }

    async fn seed_agent(node: &TestNode, client_id: &str, org: &str, gateway_id: &str) {
        node.registry
            .register(Registration {
                kind: ClientKind::Agent,
                connection_id: uuid::Uuid::new_v4(),
                client_id: client_id.into(),
                organization_id: org.into(),
                registered_agent_id: None,
                client_version: None,
                gateway_id: Some(gateway_id.into()),
                client_ip: None,
            })
            .await
            .unwrap();
    }

    fn command(from: &str, to: &str) -> Envelope {
        Envelope::new(MessageType::Command)
            .from_id(from)
            .to_id(to)
            .with_message_id("m2")
            .with_raw_payload(r#"{"command":"status"}"#)
    }

    #[tokio::test]
    async fn command_reaches_local_agent_encrypted() {
        let node = test_node(NodeRole::Service, "svc-1");
        seed_agent(&node, "A1", "T1", "svc-1").await;
        let (agent_socket, agent_sink) = agent("T1", "A1");
        node.ctx.directory.add_client(agent_socket);
        let (portal_socket, _) = portal("T1", "P1");
        node.ctx.directory.add_client(portal_socket.clone());

        run(node.ctx.clone(), portal_socket, command("P1", "A1"))
            .await
            .unwrap();

        let frames = agent_sink.sent();
        assert_eq!(frames.len(), 1);
        // The agent receives the original envelope, encrypted to its key
        let envelope = sealing::open_encrypted(frames[0].as_bytes(), &test_keys()).unwrap();
        assert_eq!(envelope.kind, MessageType::Command);
        assert_eq!(envelope.from.as_deref(), Some("P1"));
        assert_eq!(envelope.message_id.as_deref(), Some("m2"));
    }

    #[tokio::test]
    async fn command_routes_via_matching_gateway() {
        let node = test_node(NodeRole::Service, "svc-1");
        seed_agent(&node, "A3", "T1", "gw-1").await;
        let gateway_sink = RecordingSink::new();
        let gateway = SocketState::new(
            ConnectionState::GatewayAuth,
            Box::new(gateway_sink.clone()),
            None,
        );
        gateway.assign_peer_id("gw-1", "gateway").unwrap();
        node.ctx.directory.add_gateway(gateway.clone());
        let (portal_socket, _) = portal("T1", "P1");

        run(node.ctx.clone(), portal_socket, command("P1", "A3"))
            .await
            .unwrap();

        let outer = gateway_sink.sent_envelopes().pop().unwrap();
        assert_eq!(outer.kind, MessageType::Proxy);
        assert_eq!(outer.to.as_deref(), Some("gw-1"));
        let proxy: ProxyPayload = outer.parse_payload().unwrap();
        assert_eq!(proxy.kind, MessageType::Command);
        assert_eq!(proxy.from, "P1");
        assert_eq!(proxy.to, "A3");
        assert_eq!(proxy.organization_id, "T1");
        assert_eq!(proxy.inner_message.as_deref(), Some(r#"{"command":"status"}"#));
        // Return-path interest is recorded
        assert!(gateway.interest().contains("T1", "A3"));
    }

    #[tokio::test]
    async fn cross_tenant_command_closes_both_streams() {
        let node = test_node(NodeRole::Service, "svc-1");
        // A2 lives in T2, locally attached
        let (foreign_agent, foreign_sink) = agent("T2", "A2");
        node.ctx.directory.add_client(foreign_agent);
        let (portal_socket, _) = portal("T1", "P1");

        let err = run(node.ctx.clone(), portal_socket, command("P1", "A2"))
            .await
            .unwrap_err();
        assert!(err.is_policy_violation());
        assert!(matches!(err, RelayError::PolicyViolation { ref reason } if reason == "Access denied"));

        let (code, reason) = foreign_sink.closed().unwrap();
        assert_eq!(code, CloseCode::PolicyViolation);
        assert_eq!(reason, "Access denied");
    }

    #[tokio::test]
    async fn impersonated_portal_is_denied() {
        let node = test_node(NodeRole::Service, "svc-1");
        seed_agent(&node, "A1", "T1", "svc-1").await;
        let (portal_socket, _) = portal("T1", "P1");
        portal_socket.set_impersonated(true);

        let err = run(node.ctx.clone(), portal_socket, command("P1", "A1"))
            .await
            .unwrap_err();
        assert!(err.is_policy_violation());
    }

    #[tokio::test]
    async fn unreachable_target_reports_destination_unavailable() {
        let node = test_node(NodeRole::Service, "svc-1");
        let (portal_socket, portal_sink) = portal("T1", "P1");

        run(node.ctx.clone(), portal_socket, command("P1", "A9"))
            .await
            .unwrap();

        let reply = portal_sink.sent_envelopes().pop().unwrap();
        assert_eq!(reply.kind, MessageType::Command);
        assert_eq!(reply.error_message.as_deref(), Some(DESTINATION_UNAVAILABLE));
        assert_eq!(reply.message_id.as_deref(), Some("m2"));
    }

    #[tokio::test]
    async fn registered_but_detached_agent_reports_unavailable() {
        let node = test_node(NodeRole::Service, "svc-1");
        // Row exists and claims this node, but no stream is attached
        seed_agent(&node, "A1", "T1", "svc-1").await;
        let (portal_socket, portal_sink) = portal("T1", "P1");

        run(node.ctx.clone(), portal_socket, command("P1", "A1"))
            .await
            .unwrap();

        let reply = portal_sink.sent_envelopes().pop().unwrap();
        assert_eq!(reply.error_message.as_deref(), Some(DESTINATION_UNAVAILABLE));
    }

    #[tokio::test]
    async fn agent_response_routes_back_to_local_portal() {
        let node = test_node(NodeRole::Service, "svc-1");
        node.registry
            .register(Registration {
                kind: ClientKind::Portal,
                connection_id: uuid::Uuid::new_v4(),
                client_id: "P1".into(),
                organization_id: "T1".into(),
                registered_agent_id: None,
                client_version: None,
                gateway_id: Some("svc-1".into()),
                client_ip: None,
            })
            .await
            .unwrap();
        let (portal_socket, portal_sink) = portal("T1", "P1");
        node.ctx.directory.add_client(portal_socket);
        let (agent_socket, _) = agent("T1", "A1");

        run(node.ctx.clone(), agent_socket, command("A1", "P1"))
            .await
            .unwrap();

        let forwarded = portal_sink.sent_envelopes().pop().unwrap();
        assert_eq!(forwarded.kind, MessageType::Command);
        assert_eq!(forwarded.from.as_deref(), Some("A1"));
    }

    #[tokio::test]
    async fn command_from_unauthenticated_stream_is_policy_violation() {
        let node = test_node(NodeRole::Service, "svc-1");
        let socket = SocketState::new(
            ConnectionState::PortalUnauth,
            Box::new(RecordingSink::new()),
            None,
        );
        let err = run(node.ctx.clone(), socket, command("P1", "A1"))
            .await
            .unwrap_err();
        assert!(err.is_policy_violation());
    }
}
