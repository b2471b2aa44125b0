//! Tenant-scoped agent listing
//!
//! Portals ask for the agents of their tenant; stale registry rows are
//! already filtered out by the store. The same behavior also backs the
//! list-push side effect: hooks synthesize a `list` envelope on a portal's
//! behalf and run it through here.

use std::sync::Arc;

use tracing::warn;

use strand_protocol::{Envelope, MessageType};

use crate::context::RelayContext;
use crate::error::{RelayError, Result};
use crate::socket::{Seal, SocketState};
use crate::state::ConnectionState;

pub(crate) async fn run(
    ctx: Arc<RelayContext>,
    socket: Arc<SocketState>,
    envelope: Envelope,
) -> Result<()> {
    if socket.state() != ConnectionState::PortalAuth {
        return Err(RelayError::policy("List requires an authenticated portal"));
    }
    let organization_id = socket
        .organization_id()
        .ok_or_else(|| RelayError::policy("List on a stream without a tenant"))?;
    let client_id = socket.client_id().unwrap_or_default();

    let mut reply = Envelope::new(MessageType::List)
        .from_id(ctx.instance_id())
        .to_id(client_id);
    if let Some(message_id) = &envelope.message_id {
        reply = reply.with_message_id(message_id.clone());
    }

    let reply = match ctx.registry.agents(&organization_id).await {
        Ok(agents) => reply.with_payload(&agents)?,
        Err(e) => {
            warn!(error = %e, organization_id = %organization_id, "agent listing failed");
            reply.with_error("Unable to list clients")
        }
    };
    socket.send(&reply, Seal::Plain).await?;
    Ok(())
}
