//! Outbound gateway keeper
//!
//! Service nodes dial their configured gateways and keep those connections
//! alive forever: dial, run the standard receive loop plus a liveness tick,
//! and on any failure wait out the reconnect interval and try again. The
//! `failed_attempts` gauge counts consecutive dial failures and resets once
//! the handshake completes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use strand_protocol::{Envelope, MessageType};

use crate::context::RelayContext;
use crate::error::{RelayError, Result};
use crate::receive::{run_connection, StreamOrigin};
use crate::socket::{Seal, SocketState};
use crate::state::ConnectionState;
use crate::transport::{CloseCode, FrameSink, FrameSource, InboundFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Maintain one outward gateway connection until shutdown
pub async fn run_keeper(ctx: Arc<RelayContext>, url: String) {
    let mut shutdown = ctx.shutdown.listener();
    let failed_attempts = ctx
        .metrics
        .gateway_failed_attempts
        .with_label_values(&[url.as_str()]);

    loop {
        if shutdown.is_triggered() {
            break;
        }
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((stream, _response)) => {
                info!(gateway = %url, "outward gateway connected");
                let (sink, source) = stream.split();
                let socket = SocketState::new(
                    ConnectionState::GatewayUnauth,
                    Box::new(WsClientSink { inner: sink }),
                    None,
                );
                ctx.directory.add_gateway(socket.clone());

                let liveness = tokio::spawn(liveness_loop(ctx.clone(), socket.clone(), url.clone()));
                run_connection(
                    ctx.clone(),
                    socket,
                    Box::new(WsClientSource { inner: source }),
                    StreamOrigin::Outward,
                )
                .await;
                liveness.abort();
                debug!(gateway = %url, "outward gateway connection ended");
            }
            Err(e) => {
                failed_attempts.inc();
                warn!(
                    gateway = %url,
                    error = %e,
                    failed_attempts = failed_attempts.get(),
                    "outward gateway dial failed"
                );
            }
        }

        tokio::select! {
            _ = shutdown.wait() => break,
            _ = tokio::time::sleep(ctx.config.limits.reconnect_interval()) => {}
        }
    }
    debug!(gateway = %url, "keeper finished");
}

/// Tick alongside the receive loop: reset the failure gauge once
/// authenticated, and nudge an idle peer with a ping
async fn liveness_loop(ctx: Arc<RelayContext>, socket: Arc<SocketState>, url: String) {
    let ping_interval = ctx.config.limits.ping_interval();
    let idle_threshold = ping_interval * 2;
    let mut was_authenticated = false;
    let mut ticker = tokio::time::interval(ping_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if !socket.is_authenticated() {
            continue;
        }
        if !was_authenticated {
            was_authenticated = true;
            ctx.metrics
                .gateway_failed_attempts
                .with_label_values(&[url.as_str()])
                .set(0);
        }
        if ctx.config.features.disable_ping_messages {
            continue;
        }
        let idle = Utc::now().signed_duration_since(socket.last_received());
        if idle.to_std().unwrap_or_default() >= idle_threshold {
            let ping = Envelope::new(MessageType::Ping).from_id(ctx.instance_id());
            if let Err(e) = socket.send(&ping, Seal::Plain).await {
                debug!(error = %e, "keeper ping failed");
            }
        }
    }
}

/// Write half of a dialed gateway stream
struct WsClientSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsClientSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.inner
            .send(Message::Text(text))
            .await
            .map_err(|e| RelayError::transport(format!("websocket send failed: {e}")))
    }

    async fn close(&mut self, code: CloseCode, reason: &str) -> Result<()> {
        self.inner
            .send(Message::Close(Some(CloseFrame {
                code: WsCloseCode::from(code.code()),
                reason: reason.to_string().into(),
            })))
            .await
            .map_err(|e| RelayError::transport(format!("websocket close failed: {e}")))
    }
}

/// Read half of a dialed gateway stream
struct WsClientSource {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsClientSource {
    async fn next_frame(&mut self) -> Option<Result<InboundFrame>> {
        loop {
            return match self.inner.next().await? {
                Ok(Message::Text(text)) => Some(Ok(InboundFrame::Text(text))),
                Ok(Message::Binary(bytes)) => Some(Ok(InboundFrame::Binary(bytes))),
                Ok(Message::Close(_)) => Some(Ok(InboundFrame::Closed)),
                // Transport-level ping/pong is handled by tungstenite
                Ok(_) => continue,
                Err(e) => Some(Err(RelayError::transport(format!(
                    "websocket read failed: {e}"
                )))),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_node;
    use strand_config::NodeRole;

    #[tokio::test]
    async fn keeper_counts_failed_dials_and_stops_on_shutdown() {
        let node = test_node(NodeRole::Service, "svc-1");
        // Nothing listens here; every dial fails fast
        let url = "ws://127.0.0.1:1".to_string();
        let keeper = tokio::spawn(run_keeper(node.ctx.clone(), url.clone()));

        // Wait for at least one failed attempt
        let gauge = node
            .ctx
            .metrics
            .gateway_failed_attempts
            .with_label_values(&[url.as_str()]);
        for _ in 0..100 {
            if gauge.get() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(gauge.get() >= 1);

        node.ctx.shutdown.trigger();
        keeper.await.unwrap();
    }
}
