//! External-request intake
//!
//! Agent-control requests arriving on the message bus fan into the same
//! relay fabric as portal commands: locate the target agent, relay the
//! request (directly or through a gateway peer), await the correlated
//! response, and always answer on the bus — timeouts and absent targets
//! included.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use strand_protocol::{ControlRequest, Envelope, MessageType, ProxyPayload};

use crate::context::RelayContext;
use crate::pending::{PendingKey, PendingOutcome};
use crate::ports::{AgentControlCommandRequest, AgentControlCommandResponse, BusControlRequest};
use crate::socket::Seal;

const NOT_CONNECTED: &str = "Client was not connected";

/// Consume bus requests until the channel closes or the node shuts down
pub async fn run_intake(ctx: Arc<RelayContext>, mut requests: mpsc::Receiver<BusControlRequest>) {
    let mut shutdown = ctx.shutdown.listener();
    loop {
        let request = tokio::select! {
            _ = shutdown.wait() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        // Each conversation is independent; a slow agent must not block
        // the next request.
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let response = relay_control(&ctx, &request.request).await;
            if request.reply.send(response).is_err() {
                warn!("bus reply channel dropped before the response was sent");
            }
        });
    }
    debug!("bus intake finished");
}

/// Route one control request and wait for the agent's answer
pub async fn relay_control(
    ctx: &Arc<RelayContext>,
    request: &AgentControlCommandRequest,
) -> AgentControlCommandResponse {
    let failure = |message: String| AgentControlCommandResponse {
        agent_id: request.agent_id.clone(),
        organization_id: request.organization_id.clone(),
        settings: None,
        success: false,
        message: Some(message),
    };

    // The registry row tells us which node terminates the agent
    let rows = match ctx.registry.agents(&request.organization_id).await {
        Ok(rows) => rows,
        Err(e) => {
            warn!(error = %e, "registry lookup for control relay failed");
            return failure(NOT_CONNECTED.to_string());
        }
    };
    let Some(record) = rows
        .iter()
        .find(|r| r.machine_registration_id.as_deref() == Some(request.agent_id.as_str()))
    else {
        return failure(NOT_CONNECTED.to_string());
    };

    let control = ControlRequest {
        command: request.command.clone(),
        settings: request.settings.clone(),
    };
    let inner_message = match serde_json::to_string(&control) {
        Ok(raw) => raw,
        Err(e) => return failure(format!("Failed to send message to client: {e}")),
    };

    // Pick the route before registering the wait, so an unreachable agent
    // answers immediately.
    enum Route {
        Gateway(Arc<crate::socket::SocketState>),
        Local(Arc<crate::socket::SocketState>),
    }
    let route = record
        .gateway_id
        .as_deref()
        .filter(|gid| *gid != ctx.instance_id())
        .and_then(|gid| ctx.directory.find_gateway(gid))
        .map(Route::Gateway)
        .or_else(|| {
            ctx.directory
                .find_agent(&request.organization_id, &record.client_id)
                .map(Route::Local)
        });
    let Some(route) = route else {
        return failure(NOT_CONNECTED.to_string());
    };

    let envelope_id = uuid::Uuid::new_v4().to_string();
    let key = PendingKey::new(&request.organization_id, &record.client_id, &envelope_id);
    let ticket = ctx
        .pending
        .prepare(key, ctx.config.limits.control_response_timeout());
    ctx.metrics.pending_responses.inc();

    let send_result = match &route {
        Route::Gateway(gateway) => {
            let proxy = ProxyPayload {
                kind: MessageType::Control,
                from: ctx.instance_id().to_string(),
                to: record.client_id.clone(),
                organization_id: request.organization_id.clone(),
                inner_message: Some(inner_message),
            };
            gateway
                .interest()
                .mark(&request.organization_id, &record.client_id);
            match Envelope::new(MessageType::Proxy)
                .from_id(ctx.instance_id())
                .to_id(gateway.client_id().unwrap_or_default())
                .with_message_id(envelope_id.clone())
                .with_payload(&proxy)
            {
                Ok(outer) => gateway.send(&outer, Seal::Plain).await,
                Err(e) => Err(e.into()),
            }
        }
        Route::Local(agent) => match agent.peer_public_key() {
            Some(agent_key) => {
                let envelope = Envelope::new(MessageType::Control)
                    .from_id(ctx.instance_id())
                    .to_id(record.client_id.clone())
                    .with_message_id(envelope_id.clone())
                    .with_raw_payload(inner_message);
                agent.send(&envelope, Seal::Encrypted(agent_key)).await
            }
            None => Err(crate::error::RelayError::transport(
                "agent presented no public key",
            )),
        },
    };
    if let Err(e) = send_result {
        ctx.metrics.pending_responses.dec();
        return failure(format!("Failed to send message to client: {e}"));
    }

    info!(
        agent_id = %request.agent_id,
        organization_id = %request.organization_id,
        message_id = %envelope_id,
        "control request relayed, awaiting response"
    );

    let outcome = ticket.wait().await;
    ctx.metrics.pending_responses.dec();
    match outcome {
        PendingOutcome::Completed(response) => AgentControlCommandResponse {
            agent_id: request.agent_id.clone(),
            organization_id: request.organization_id.clone(),
            settings: response.output,
            success: response.success,
            message: response.message,
        },
        PendingOutcome::TimedOut => failure(format!(
            "Failed to send message to client: no response within {}s",
            ctx.config.limits.control_response_timeout_secs
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Registration, RegistryStore};
    use crate::state::ConnectionState;
    use crate::testutil::{test_keys, test_node, RecordingSink, TestNode};
    use strand_protocol::{sealing, ClientKind, ControlResponse, PeerPublicKey};

    fn request(agent_id: &str, org: &str) -> AgentControlCommandRequest {
        AgentControlCommandRequest {
            agent_id: agent_id.into(),
            organization_id: org.into(),
            command: "reboot".into(),
            settings: Some(serde_json::json!({})),
        }
    }

    async fn seed_agent(node: &TestNode, client_id: &str, machine_id: &str, gateway_id: &str) {
        node.registry
            .register(Registration {
                kind: ClientKind::Agent,
                connection_id: uuid::Uuid::new_v4(),
                client_id: client_id.into(),
                organization_id: "T1".into(),
                registered_agent_id: Some(machine_id.into()),
                client_version: None,
                gateway_id: Some(gateway_id.into()),
                client_ip: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn absent_agent_answers_not_connected() {
        let node = test_node(strand_config::NodeRole::Service, "svc-1");
        let response = relay_control(&node.ctx, &request("r-7", "T1")).await;
        assert!(!response.success);
        assert_eq!(response.message.as_deref(), Some(NOT_CONNECTED));
        assert_eq!(response.agent_id, "r-7");
    }

    #[tokio::test]
    async fn registered_but_detached_agent_answers_not_connected() {
        let node = test_node(strand_config::NodeRole::Service, "svc-1");
        seed_agent(&node, "A1", "r-7", "svc-1").await;
        let response = relay_control(&node.ctx, &request("r-7", "T1")).await;
        assert!(!response.success);
        assert_eq!(response.message.as_deref(), Some(NOT_CONNECTED));
    }

    #[tokio::test]
    async fn local_agent_round_trip() {
        let node = test_node(strand_config::NodeRole::Service, "svc-1");
        seed_agent(&node, "A1", "r-7", "svc-1").await;
        let sink = RecordingSink::new();
        let agent = crate::socket::SocketState::new(
            ConnectionState::AgentAuth,
            Box::new(sink.clone()),
            None,
        );
        agent.assign_identity("A1", "T1", None, None).unwrap();
        agent.set_peer_public_key(
            PeerPublicKey::from_pem(&test_keys().public_key_pem().unwrap()).unwrap(),
        );
        node.ctx.directory.add_client(agent);

        let ctx = node.ctx.clone();
        let relay = tokio::spawn(async move { relay_control(&ctx, &request("r-7", "T1")).await });

        // Wait for the encrypted control frame to land on the agent
        let frame = loop {
            if let Some(frame) = sink.sent().pop() {
                break frame;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };
        let envelope = sealing::open_encrypted(frame.as_bytes(), &test_keys()).unwrap();
        assert_eq!(envelope.kind, MessageType::Control);
        let control: ControlRequest = envelope.parse_payload().unwrap();
        assert_eq!(control.command, "reboot");

        // The agent answers; the correlator hands it back to the intake
        node.ctx.pending.complete(
            &PendingKey::new("T1", "A1", envelope.message_id.clone().unwrap()),
            ControlResponse {
                success: true,
                output: Some(serde_json::json!({"rebooted": true})),
                message: None,
            },
        );

        let response = relay.await.unwrap();
        assert!(response.success);
        assert_eq!(response.settings.unwrap()["rebooted"], true);
        assert!(node.ctx.pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_agent_times_out_with_failure_response() {
        let node = test_node(strand_config::NodeRole::Service, "svc-1");
        seed_agent(&node, "A1", "r-7", "svc-1").await;
        let agent = crate::socket::SocketState::new(
            ConnectionState::AgentAuth,
            Box::new(RecordingSink::new()),
            None,
        );
        agent.assign_identity("A1", "T1", None, None).unwrap();
        agent.set_peer_public_key(
            PeerPublicKey::from_pem(&test_keys().public_key_pem().unwrap()).unwrap(),
        );
        node.ctx.directory.add_client(agent);

        let response = relay_control(&node.ctx, &request("r-7", "T1")).await;
        assert!(!response.success);
        assert!(response
            .message
            .unwrap()
            .starts_with("Failed to send message to client"));
        assert!(node.ctx.pending.is_empty());
    }

    #[tokio::test]
    async fn remote_agent_routes_through_gateway() {
        let node = test_node(strand_config::NodeRole::Service, "svc-1");
        seed_agent(&node, "A3", "r-9", "gw-1").await;
        let gateway_sink = RecordingSink::new();
        let gateway = crate::socket::SocketState::new(
            ConnectionState::GatewayAuth,
            Box::new(gateway_sink.clone()),
            None,
        );
        gateway.assign_peer_id("gw-1", "gateway").unwrap();
        node.ctx.directory.add_gateway(gateway.clone());

        let ctx = node.ctx.clone();
        let relay = tokio::spawn(async move { relay_control(&ctx, &request("r-9", "T1")).await });

        let outer = loop {
            if let Some(envelope) = gateway_sink.sent_envelopes().pop() {
                break envelope;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };
        assert_eq!(outer.kind, MessageType::Proxy);
        let proxy: ProxyPayload = outer.parse_payload().unwrap();
        assert_eq!(proxy.kind, MessageType::Control);
        assert_eq!(proxy.from, "svc-1");
        assert_eq!(proxy.to, "A3");
        assert!(gateway.interest().contains("T1", "A3"));

        node.ctx.pending.complete(
            &PendingKey::new("T1", "A3", outer.message_id.clone().unwrap()),
            ControlResponse {
                success: true,
                output: None,
                message: None,
            },
        );
        assert!(relay.await.unwrap().success);
    }

    #[tokio::test]
    async fn intake_always_replies() {
        let node = test_node(strand_config::NodeRole::Service, "svc-1");
        let (tx, rx) = mpsc::channel(4);
        let intake = tokio::spawn(run_intake(node.ctx.clone(), rx));

        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        tx.send(BusControlRequest {
            request: request("r-7", "T1"),
            reply: reply_tx,
        })
        .await
        .unwrap();

        let response = reply_rx.await.unwrap();
        assert!(!response.success);

        drop(tx);
        intake.await.unwrap();
    }
}
