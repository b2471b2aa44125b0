//! Liveness probes
//!
//! Both sides of every authenticated stream use `ping`/`pong` to monitor
//! liveness; each observation bumps the tenant registry activity row so
//! list results stay fresh.

use std::sync::Arc;

use tracing::{debug, warn};

use strand_protocol::{ClientKind, Envelope, MessageType};

use crate::context::RelayContext;
use crate::error::{RelayError, Result};
use crate::hooks;
use crate::ports::AgentActivityType;
use crate::socket::{Seal, SocketState};

pub(crate) async fn run_ping(
    ctx: Arc<RelayContext>,
    socket: Arc<SocketState>,
    envelope: Envelope,
) -> Result<()> {
    if !socket.is_authenticated() {
        return Err(RelayError::policy("Ping before authentication"));
    }
    touch_activity(&ctx, &socket).await;
    if socket.kind() == ClientKind::Agent {
        hooks::publish_activity(&ctx, &socket, AgentActivityType::Ping).await;
    }

    let mut pong = Envelope::new(MessageType::Pong).from_id(ctx.instance_id());
    if let Some(from) = &envelope.from {
        pong = pong.to_id(from.clone());
    }
    if let Err(e) = socket.send(&pong, Seal::Plain).await {
        warn!(error = %e, connection_id = %socket.connection_id(), "failed to send pong");
    }
    Ok(())
}

pub(crate) async fn run_pong(
    ctx: Arc<RelayContext>,
    socket: Arc<SocketState>,
    _envelope: Envelope,
) -> Result<()> {
    if !socket.is_authenticated() {
        return Err(RelayError::policy("Pong before authentication"));
    }
    touch_activity(&ctx, &socket).await;
    Ok(())
}

async fn touch_activity(ctx: &Arc<RelayContext>, socket: &Arc<SocketState>) {
    // Gateway peers have no registry row; update_activity simply reports
    // false for them.
    if let (Some(client_id), Some(org)) = (socket.client_id(), socket.organization_id()) {
        match ctx.registry.update_activity(&client_id, &org).await {
            Ok(false) => debug!(client_id = %client_id, "no registry row to refresh"),
            Ok(true) => {}
            Err(e) => warn!(error = %e, "activity update failed"),
        }
    }
}
