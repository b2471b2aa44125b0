//! HTTP surface and WebSocket ingress
//!
//! Three WebSocket routes tag the initial connection state: `/portal`,
//! `/agent` and (on gateway nodes) `/gateway`. Plain HTTP requests to the
//! upgrade routes get a 400; `/` redirects or 404s; `/health` and
//! `/metrics` serve probes.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocket;
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::{debug, info};

use strand_config::NodeRole;
use strand_relay_core::{
    run_connection, ConnectionState, RelayContext, SocketState, StreamOrigin,
};

use crate::ws;

type WsUpgrade = Result<WebSocketUpgrade, axum::extract::ws::rejection::WebSocketUpgradeRejection>;

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<RelayContext>,
}

/// Build the router for this node's role
pub fn build_router(ctx: Arc<RelayContext>) -> Router {
    let mut router = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/agent", get(agent_ingress))
        .route("/portal", get(portal_ingress));
    if ctx.role() == NodeRole::Gateway {
        router = router.route("/gateway", get(gateway_ingress));
    }
    router.with_state(AppState { ctx })
}

async fn root(State(state): State<AppState>) -> Response {
    match &state.ctx.config.network.redirect_url {
        Some(url) => (StatusCode::FOUND, [(header::LOCATION, url.clone())]).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.ctx.metrics.render() {
        Ok(text) => text.into_response(),
        Err(e) => {
            debug!(error = %e, "metrics render failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn agent_ingress(
    ws: WsUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    upgrade(ws, state, addr, ConnectionState::AgentUnauth)
}

async fn portal_ingress(
    ws: WsUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    upgrade(ws, state, addr, ConnectionState::PortalUnauth)
}

async fn gateway_ingress(
    ws: WsUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    upgrade(ws, state, addr, ConnectionState::GatewayUnauth)
}

fn upgrade(
    ws: WsUpgrade,
    state: AppState,
    addr: SocketAddr,
    initial_state: ConnectionState,
) -> Response {
    let Ok(ws) = ws else {
        return (StatusCode::BAD_REQUEST, "Only websocket clients are allowed").into_response();
    };
    let limit = state.ctx.config.limits.max_message_size;
    ws.max_message_size(limit)
        .on_upgrade(move |socket| attach(state.ctx, socket, initial_state, addr))
        .into_response()
}

async fn attach(
    ctx: Arc<RelayContext>,
    socket: WebSocket,
    initial_state: ConnectionState,
    addr: SocketAddr,
) {
    info!(
        remote = %addr,
        state = ?initial_state,
        "stream attached"
    );
    let (sink, source) = ws::split(socket);
    let socket_state = SocketState::new(
        initial_state,
        Box::new(sink),
        Some(addr.ip().to_string()),
    );
    if initial_state == ConnectionState::GatewayUnauth {
        ctx.directory.add_gateway(socket_state.clone());
    } else {
        ctx.directory.add_client(socket_state.clone());
    }
    run_connection(ctx, socket_state, Box::new(source), StreamOrigin::Ingress).await;
}
