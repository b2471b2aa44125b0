//! Behavior dispatch
//!
//! A behavior is the per-type rule set of the protocol. The dispatch table
//! is fixed per role at startup; preconditions live inside each behavior,
//! dispatch itself knows nothing about connection state.

pub(crate) mod auth_agent;
pub(crate) mod auth_gateway;
pub(crate) mod auth_portal;
pub(crate) mod command;
pub(crate) mod control;
pub(crate) mod list;
pub(crate) mod ping;
pub(crate) mod proxy;
pub(crate) mod welcome;

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tracing::debug;

use strand_config::NodeRole;
use strand_protocol::{Envelope, MessageType};

use crate::context::RelayContext;
use crate::error::Result;
use crate::socket::SocketState;

type BehaviorFuture = BoxFuture<'static, Result<()>>;
type BehaviorFn = fn(Arc<RelayContext>, Arc<SocketState>, Envelope) -> BehaviorFuture;

/// The fixed message-type → behavior table for one role
pub struct BehaviorSet {
    handlers: HashMap<MessageType, BehaviorFn>,
}

impl BehaviorSet {
    /// Build the table for a role
    pub fn for_role(role: NodeRole) -> Self {
        let mut handlers: HashMap<MessageType, BehaviorFn> = HashMap::new();
        handlers.insert(MessageType::AuthPortal, auth_portal_behavior);
        handlers.insert(MessageType::Auth, auth_agent_behavior);
        handlers.insert(MessageType::Ping, ping_behavior);
        handlers.insert(MessageType::Pong, pong_behavior);
        handlers.insert(MessageType::List, list_behavior);
        handlers.insert(MessageType::Command, command_behavior);
        handlers.insert(MessageType::Control, control_behavior);
        handlers.insert(MessageType::Proxy, proxy_behavior);
        match role {
            // A service node dials outward and answers the gateway `welcome`
            NodeRole::Service => {
                handlers.insert(MessageType::Welcome, welcome_behavior);
            }
            // A gateway node verifies the handshake reply
            NodeRole::Gateway => {
                handlers.insert(MessageType::AuthGateway, auth_gateway_behavior);
            }
        }
        Self { handlers }
    }

    /// Run the behavior registered for `envelope.kind`
    ///
    /// An absent handler is logged and ignored; the stream stays up.
    pub async fn dispatch(
        &self,
        ctx: Arc<RelayContext>,
        socket: Arc<SocketState>,
        envelope: Envelope,
    ) -> Result<()> {
        match self.handlers.get(&envelope.kind) {
            Some(run) => run(ctx, socket, envelope).await,
            None => {
                debug!(
                    message_type = %envelope.kind,
                    connection_id = %socket.connection_id(),
                    "no behavior registered for message type, ignoring"
                );
                Ok(())
            }
        }
    }
}

fn auth_portal_behavior(
    ctx: Arc<RelayContext>,
    socket: Arc<SocketState>,
    envelope: Envelope,
) -> BehaviorFuture {
    Box::pin(auth_portal::run(ctx, socket, envelope))
}

fn auth_agent_behavior(
    ctx: Arc<RelayContext>,
    socket: Arc<SocketState>,
    envelope: Envelope,
) -> BehaviorFuture {
    Box::pin(auth_agent::run(ctx, socket, envelope))
}

fn auth_gateway_behavior(
    ctx: Arc<RelayContext>,
    socket: Arc<SocketState>,
    envelope: Envelope,
) -> BehaviorFuture {
    Box::pin(auth_gateway::run(ctx, socket, envelope))
}

fn ping_behavior(
    ctx: Arc<RelayContext>,
    socket: Arc<SocketState>,
    envelope: Envelope,
) -> BehaviorFuture {
    Box::pin(ping::run_ping(ctx, socket, envelope))
}

fn pong_behavior(
    ctx: Arc<RelayContext>,
    socket: Arc<SocketState>,
    envelope: Envelope,
) -> BehaviorFuture {
    Box::pin(ping::run_pong(ctx, socket, envelope))
}

fn list_behavior(
    ctx: Arc<RelayContext>,
    socket: Arc<SocketState>,
    envelope: Envelope,
) -> BehaviorFuture {
    Box::pin(list::run(ctx, socket, envelope))
}

fn command_behavior(
    ctx: Arc<RelayContext>,
    socket: Arc<SocketState>,
    envelope: Envelope,
) -> BehaviorFuture {
    Box::pin(command::run(ctx, socket, envelope))
}

fn control_behavior(
    ctx: Arc<RelayContext>,
    socket: Arc<SocketState>,
    envelope: Envelope,
) -> BehaviorFuture {
    Box::pin(control::run(ctx, socket, envelope))
}

fn proxy_behavior(
    ctx: Arc<RelayContext>,
    socket: Arc<SocketState>,
    envelope: Envelope,
) -> BehaviorFuture {
    Box::pin(proxy::run(ctx, socket, envelope))
}

fn welcome_behavior(
    ctx: Arc<RelayContext>,
    socket: Arc<SocketState>,
    envelope: Envelope,
) -> BehaviorFuture {
    Box::pin(welcome::run(ctx, socket, envelope))
}
