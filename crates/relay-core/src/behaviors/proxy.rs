//! Cross-node proxy envelopes
//!
//! Proxy envelopes travel on authenticated gateway connections, in both
//! directions: a Service relays requests toward the node terminating the
//! target, and responses ride the same wrapping back. Only `command`,
//! `control` and `list` may travel inside; anything else is counted and
//! dropped.

use std::sync::Arc;

use tracing::{debug, warn};

use strand_protocol::{ControlResponse, Envelope, MessageType, ProxyPayload};

use crate::behaviors::list;
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
    if socket.state() != ConnectionState::GatewayAuth {
        return Err(RelayError::policy(
            "Proxy requires an authenticated gateway peer",
        ));
    }
    let proxy: ProxyPayload = envelope
        .parse_payload()
        .map_err(|_| RelayError::policy("Invalid proxy payload"))?;

    match proxy.kind {
        MessageType::Command => relay_command(&ctx, &socket, &envelope, &proxy).await,
        MessageType::Control => relay_control(&ctx, &socket, &envelope, &proxy).await,
        MessageType::List => push_lists(&ctx, &proxy).await,
        other => {
            ctx.metrics.invalid_proxy_messages.inc();
            warn!(inner_type = %other, "proxy envelope with disallowed inner type dropped");
            Ok(())
        }
    }
}

/// Deliver a proxied command to the locally-attached target
///
/// Requests land on agents (Encrypt); responses riding the reverse path
/// land on portals (PlainText).
async fn relay_command(
    ctx: &Arc<RelayContext>,
    socket: &Arc<SocketState>,
    envelope: &Envelope,
    proxy: &ProxyPayload,
) -> Result<()> {
    if let Some(portal) = ctx.directory.find_portal(&proxy.organization_id, &proxy.to) {
        let mut inner = Envelope::new(MessageType::Command)
            .from_id(proxy.from.clone())
            .to_id(proxy.to.clone());
        if let Some(message_id) = &envelope.message_id {
            inner = inner.with_message_id(message_id.clone());
        }
        if let Some(payload) = &proxy.inner_message {
            inner = inner.with_raw_payload(payload.clone());
        }
        if let Err(e) = portal.send(&inner, Seal::Plain).await {
            warn!(error = %e, target = %proxy.to, "proxied command delivery failed");
        }
        return Ok(());
    }

    let Some(agent) = ctx.directory.find_agent(&proxy.organization_id, &proxy.to) else {
        // A locally-attached client under another tenant is a cross-tenant
        // attempt; a plainly absent target is just dropped.
        let mismatch = ctx
            .directory
            .first_client_where(|s| {
                s.is_authenticated()
                    && s.client_id().as_deref() == Some(proxy.to.as_str())
                    && s.organization_id().as_deref() != Some(proxy.organization_id.as_str())
            })
            .is_some();
        if mismatch {
            ctx.metrics.invalid_proxy_messages.inc();
            warn!(target = %proxy.to, "cross-tenant proxy command dropped");
        } else {
            debug!(target = %proxy.to, "proxied command for a detached agent dropped");
        }
        return Ok(());
    };

    let Some(key) = agent.peer_public_key() else {
        warn!(target = %proxy.to, "agent without a public key");
        return Ok(());
    };
    let mut inner = Envelope::new(MessageType::Command)
        .from_id(proxy.from.clone())
        .to_id(proxy.to.clone());
    if let Some(message_id) = &envelope.message_id {
        inner = inner.with_message_id(message_id.clone());
    }
    if let Some(payload) = &proxy.inner_message {
        inner = inner.with_raw_payload(payload.clone());
    }

    socket.interest().mark(&proxy.organization_id, &proxy.to);
    if let Err(e) = agent.send(&inner, Seal::Encrypted(key)).await {
        warn!(error = %e, target = %proxy.to, "proxied command delivery failed");
    }
    Ok(())
}

/// A proxied control frame is either a response coming home or a request
/// heading for a local agent
async fn relay_control(
    ctx: &Arc<RelayContext>,
    socket: &Arc<SocketState>,
    envelope: &Envelope,
    proxy: &ProxyPayload,
) -> Result<()> {
    let Some(message_id) = envelope.message_id.clone() else {
        debug!("proxied control without a message id dropped");
        return Ok(());
    };

    // Response direction: `from` is the agent that produced it
    if let Some(raw) = &proxy.inner_message {
        if let Ok(response) = serde_json::from_str::<ControlResponse>(raw) {
            let key = PendingKey::new(&proxy.organization_id, &proxy.from, &message_id);
            if ctx.pending.complete(&key, response) {
                return Ok(());
            }
        }
    }

    // Request direction: deliver to the locally-attached agent
    let Some(agent) = ctx.directory.find_agent(&proxy.organization_id, &proxy.to) else {
        debug!(target = %proxy.to, "proxied control for a detached agent dropped");
        return Ok(());
    };
    let Some(key) = agent.peer_public_key() else {
        warn!(target = %proxy.to, "agent without a public key");
        return Ok(());
    };

    let mut inner = Envelope::new(MessageType::Control)
        .from_id(proxy.from.clone())
        .to_id(proxy.to.clone())
        .with_message_id(message_id);
    if let Some(payload) = &proxy.inner_message {
        inner = inner.with_raw_payload(payload.clone());
    }

    socket.interest().mark(&proxy.organization_id, &proxy.to);
    if let Err(e) = agent.send(&inner, Seal::Encrypted(key)).await {
        warn!(error = %e, target = %proxy.to, "proxied control delivery failed");
    }
    Ok(())
}

/// Push a fresh list to every locally-authenticated portal of the tenant
async fn push_lists(ctx: &Arc<RelayContext>, proxy: &ProxyPayload) -> Result<()> {
    for portal in ctx.directory.portals_of(&proxy.organization_id) {
        let synthesized =
            Envelope::new(MessageType::List).from_id(portal.client_id().unwrap_or_default());
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = list::run(ctx, portal, synthesized).await {
                debug!(error = %e, "proxied list push failed");
            }
        });
    }
    Ok(())
}
