//! Agent authentication
//!
//! Agents authenticate with a backend-validated token plus the public key
//! the node will encrypt to from then on. The `auth` request itself arrives
//! Sign-Only (proof of possession of that key); the reply is Sign-Only from
//! the node's private key. Success runs the after-authenticated hook: an
//! activity event on the bus and fresh list pushes to the tenant's portals.

use std::sync::Arc;

use tracing::{info, warn};

use strand_protocol::{
    AgentAuthRequest, AuthResult, ClientKind, Envelope, MessageType, PeerPublicKey,
};

use crate::context::RelayContext;
use crate::error::{RelayError, Result};
use crate::hooks;
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
        ConnectionState::AgentUnauth | ConnectionState::AgentAuth
    ) {
        return Err(RelayError::policy(
            "Agent authentication on a non-agent stream",
        ));
    }

    let request: AgentAuthRequest = envelope
        .parse_payload()
        .map_err(|_| RelayError::policy("Invalid authentication payload"))?;
    if request.token.is_empty() {
        return Err(RelayError::policy("Invalid authentication payload"));
    }
    match request.protocol_version {
        Some(version)
            if ctx
                .config
                .features
                .allowed_protocol_versions
                .contains(&version) => {}
        _ => return Err(RelayError::policy("Invalid protocol version")),
    }

    let validation = match ctx.validator.validate_agent_token(&request.token).await {
        Ok(validation) => validation,
        Err(e) => {
            warn!(error = %e, "agent token validation backend failed");
            respond(&ctx, &socket, &envelope, AuthResult::rejected()).await;
            return Ok(());
        }
    };
    if !validation.success {
        info!(
            connection_id = %socket.connection_id(),
            "agent authentication rejected"
        );
        respond(&ctx, &socket, &envelope, AuthResult::rejected()).await;
        return Ok(());
    }

    let organization_id = match validation.organization_id.as_deref() {
        Some(org) if !org.is_empty() => org.to_string(),
        _ => {
            warn!("validator accepted an agent token without a tenant");
            respond(&ctx, &socket, &envelope, AuthResult::rejected()).await;
            return Ok(());
        }
    };

    let public_key = PeerPublicKey::from_pem(&request.public_key)
        .map_err(|_| RelayError::policy("Invalid public key"))?;
    let client_id = envelope.from.clone().unwrap_or_default();

    socket.assign_identity(
        &client_id,
        &organization_id,
        validation.registered_agent_id.clone(),
        request.client_version.clone(),
    )?;
    socket.set_peer_public_key(public_key);
    socket.set_token_expiration(validation.expires);
    socket.set_state(ConnectionState::AgentAuth);

    if let Err(e) = ctx
        .registry
        .register(Registration {
            kind: ClientKind::Agent,
            connection_id: socket.connection_id(),
            client_id: client_id.clone(),
            organization_id: organization_id.clone(),
            registered_agent_id: validation.registered_agent_id.clone(),
            client_version: request.client_version,
            gateway_id: Some(ctx.instance_id().to_string()),
            client_ip: socket.client_ip().map(String::from),
        })
        .await
    {
        warn!(error = %e, "agent registration failed");
    }

    info!(
        client_id = %client_id,
        organization_id = %organization_id,
        registered_agent_id = ?validation.registered_agent_id,
        connection_id = %socket.connection_id(),
        "agent authenticated"
    );

    respond(
        &ctx,
        &socket,
        &envelope,
        AuthResult {
            accepted: true,
            will_replace_token: validation.new_token.is_some(),
            new_token: validation.new_token,
        },
    )
    .await;

    // List pushes are side effects; a slow portal must not hold up this loop
    let hook_ctx = ctx.clone();
    let hook_socket = socket.clone();
    tokio::spawn(async move {
        hooks::after_authenticated(hook_ctx, hook_socket).await;
    });
    Ok(())
}

async fn respond(
    ctx: &Arc<RelayContext>,
    socket: &Arc<SocketState>,
    request: &Envelope,
    result: AuthResult,
) {
    let mut reply = Envelope::new(MessageType::Auth).from_id(ctx.instance_id());
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
    if let Err(e) = socket.send(&reply, Seal::Signed(ctx.keys.clone())).await {
        warn!(error = %e, "failed to send auth reply");
    }
}
