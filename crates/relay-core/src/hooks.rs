//! Connection lifecycle hooks
//!
//! After an agent authenticates (and after any client disconnects) the
//! tenant's portals get a fresh list, locally and behind gateway peers.
//! Everything here is best-effort: failures are logged and never fail the
//! triggering request.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};

use strand_protocol::{ClientKind, Envelope, MessageType, ProxyPayload};

use crate::behaviors::list;
use crate::context::RelayContext;
use crate::ports::{AgentActivityMessage, AgentActivityType};
use crate::socket::{Seal, SocketState};

/// Runs once an agent reaches `AgentAuth`
pub(crate) async fn after_authenticated(ctx: Arc<RelayContext>, socket: Arc<SocketState>) {
    if socket.kind() == ClientKind::Agent {
        publish_activity(&ctx, &socket, AgentActivityType::Connected).await;
    }
    if let Some(organization_id) = socket.organization_id() {
        push_lists(&ctx, &organization_id).await;
    }
}

/// Runs when any stream detaches
pub async fn after_disconnect(ctx: Arc<RelayContext>, socket: Arc<SocketState>) {
    ctx.directory.remove(socket.connection_id());

    let (Some(client_id), Some(organization_id)) = (socket.client_id(), socket.organization_id())
    else {
        return;
    };
    if socket.kind() == ClientKind::Gateway {
        return;
    }

    if let Err(e) = ctx
        .registry
        .deregister(
            socket.connection_id(),
            &client_id,
            &organization_id,
            socket.bytes_received(),
            socket.bytes_sent(),
        )
        .await
    {
        warn!(error = %e, client_id = %client_id, "deregistration failed");
    }
    if socket.kind() == ClientKind::Agent {
        publish_activity(&ctx, &socket, AgentActivityType::Disconnected).await;
    }
    push_lists(&ctx, &organization_id).await;
}

/// Publish an agent lifecycle event; failures are swallowed
pub(crate) async fn publish_activity(
    ctx: &Arc<RelayContext>,
    socket: &Arc<SocketState>,
    activity_type: AgentActivityType,
) {
    let Some(organization_id) = socket.organization_id() else {
        return;
    };
    let message = AgentActivityMessage {
        activity_type,
        connected_on: socket.connected_on(),
        registered_agent_id: socket.registered_agent_id(),
        organization_id,
        client_version: socket.client_version(),
        metadata: None,
    };
    if let Err(e) = ctx.bus.publish_activity(message).await {
        warn!(error = %e, "activity publish failed");
    }
}

/// Push a fresh agent list to every portal of the tenant
///
/// Local portals each get their own task so one slow stream cannot starve
/// the rest; gateway peers terminating portals of this tenant get a
/// `proxy(list)` nudge instead.
pub(crate) async fn push_lists(ctx: &Arc<RelayContext>, organization_id: &str) {
    for portal in ctx.directory.portals_of(organization_id) {
        let synthesized =
            Envelope::new(MessageType::List).from_id(portal.client_id().unwrap_or_default());
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = list::run(ctx, portal, synthesized).await {
                debug!(error = %e, "list push failed");
            }
        });
    }

    let rows = match ctx.registry.portals(organization_id).await {
        Ok(rows) => rows,
        Err(e) => {
            warn!(error = %e, "portal listing for gateway pushes failed");
            return;
        }
    };
    let gateway_ids: BTreeSet<String> = rows
        .into_iter()
        .filter_map(|row| row.gateway_id)
        .filter(|gid| gid != ctx.instance_id())
        .collect();
    for gateway_id in gateway_ids {
        let Some(gateway) = ctx.directory.find_gateway(&gateway_id) else {
            continue;
        };
        let payload = ProxyPayload {
            kind: MessageType::List,
            from: ctx.instance_id().to_string(),
            to: gateway_id.clone(),
            organization_id: organization_id.to_string(),
            inner_message: None,
        };
        let envelope = match Envelope::new(MessageType::Proxy)
            .from_id(ctx.instance_id())
            .to_id(gateway_id.clone())
            .with_payload(&payload)
        {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "failed to build list push");
                continue;
            }
        };
        if let Err(e) = gateway.send(&envelope, Seal::Plain).await {
            warn!(error = %e, gateway = %gateway_id, "gateway list push failed");
        }
    }
}
