//! Portal authentication
//!
//! Portals authenticate with a bearer token validated by the external
//! backend. The reply always goes out, accepted or not; a rejected portal
//! keeps its stream and may simply try again.

use std::sync::Arc;

use tracing::{info, warn};

use strand_protocol::{AuthResult, ClientKind, Envelope, MessageType, PortalAuthRequest};

use crate::context::RelayContext;
use crate::error::{RelayError, Result};
use crate::registry::Registration;
use crate::socket::{Seal, SocketState};
use crate::state::ConnectionState;

pub(crate) async fn run(
    ctx: Arc<RelayContext>,
    socket: Arc<SocketState>,
    envelope: Envelope,
) -> Result<()> {
    if !matches!(
        socket.state(),
        ConnectionState::PortalUnauth | ConnectionState::PortalAuth
    ) {
        return Err(RelayError::policy(
            "Portal authentication on a non-portal stream",
        ));
    }

    let request: PortalAuthRequest = envelope
        .parse_payload()
        .map_err(|_| RelayError::policy("Invalid authentication payload"))?;
    if request.token.is_empty() {
        return Err(RelayError::policy("Invalid authentication payload"));
    }

    let validation = match ctx.validator.validate_portal_token(&request.token).await {
        Ok(validation) => validation,
        Err(e) => {
            warn!(error = %e, "portal token validation backend failed");
            respond(&ctx, &socket, &envelope, AuthResult::rejected()).await;
            return Ok(());
        }
    };

    if !validation.success {
        info!(
            connection_id = %socket.connection_id(),
            "portal authentication rejected"
        );
        respond(&ctx, &socket, &envelope, AuthResult::rejected()).await;
        return Ok(());
    }

    let organization_id = match validation.organization_id.as_deref() {
        Some(org) if !org.is_empty() => org.to_string(),
        _ => {
            warn!("validator accepted a portal token without a tenant");
            respond(&ctx, &socket, &envelope, AuthResult::rejected()).await;
            return Ok(());
        }
    };
    let client_id = envelope.from.clone().unwrap_or_default();

    socket.assign_identity(
        &client_id,
        &organization_id,
        None,
        request.client_version.clone(),
    )?;
    socket.set_token_expiration(validation.expires);
    socket.set_impersonated(validation.impersonated);
    socket.set_state(ConnectionState::PortalAuth);

    if let Err(e) = ctx
        .registry
        .register(Registration {
            kind: ClientKind::Portal,
            connection_id: socket.connection_id(),
            client_id: client_id.clone(),
            organization_id: organization_id.clone(),
            registered_agent_id: None,
            client_version: request.client_version,
            gateway_id: Some(ctx.instance_id().to_string()),
            client_ip: socket.client_ip().map(String::from),
        })
        .await
    {
        warn!(error = %e, "portal registration failed");
    }

    info!(
        client_id = %client_id,
        organization_id = %organization_id,
        connection_id = %socket.connection_id(),
        "portal authenticated"
    );
    respond(&ctx, &socket, &envelope, AuthResult::accepted()).await;
    Ok(())
}

async fn respond(
    ctx: &Arc<RelayContext>,
    socket: &Arc<SocketState>,
    request: &Envelope,
    result: AuthResult,
) {
    let mut reply = Envelope::new(MessageType::AuthPortal).from_id(ctx.instance_id());
    if let Some(from) = &request.from {
        reply = reply.to_id(from.clone());
    }
    if let Some(message_id) = &request.message_id {
        reply = reply.with_message_id(message_id.clone());
    }
    let reply = match reply.with_payload(&result) {
        Ok(reply) => reply,
        Err(e) => {
            warn!(error = %e, "failed to serialize auth reply");
            return;
        }
    };
    if let Err(e) = socket.send(&reply, Seal::Plain).await {
        warn!(error = %e, "failed to send auth reply");
    }
}
