//! The per-stream receive loop
//!
//! One loop per attached stream: framed reads bounded by the pre- and
//! post-authentication size caps, wrapping inference from the connection
//! state, behavior dispatch, and the disconnect hook on every exit path.
//! Policy violations close the stream with code 1008; any other behavior
//! error is logged and the loop keeps going.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use strand_protocol::{sealing, Envelope, MessageType, Wrapping};

use crate::context::RelayContext;
use crate::error::RelayError;
use crate::hooks;
use crate::socket::{Seal, SocketState};
use crate::transport::{CloseCode, FrameSource, InboundFrame};

/// Upper bound on the graceful-close drain at shutdown
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Whether this stream was accepted or dialed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOrigin {
    /// Accepted on an ingress route; the node sends `welcome` first
    Ingress,
    /// Dialed outward to a gateway; the peer sends `welcome`
    Outward,
}

/// Drive one stream until it closes, the node shuts down, or policy ends it
pub async fn run_connection(
    ctx: Arc<RelayContext>,
    socket: Arc<SocketState>,
    mut source: Box<dyn FrameSource>,
    origin: StreamOrigin,
) {
    let kind_label = socket.kind().to_string();
    ctx.metrics
        .active_connections
        .with_label_values(&[&kind_label])
        .inc();
    ctx.metrics
        .total_connections
        .with_label_values(&[&kind_label])
        .inc();

    if origin == StreamOrigin::Ingress {
        if let Err(e) = crate::behaviors::welcome::send_welcome(&ctx, &socket).await {
            warn!(error = %e, connection_id = %socket.connection_id(), "welcome send failed");
        }
    }

    let mut shutdown = ctx.shutdown.listener();
    loop {
        let frame = tokio::select! {
            _ = shutdown.wait() => {
                let _ = tokio::time::timeout(
                    CLOSE_TIMEOUT,
                    socket.close(CloseCode::Normal, "Shutting down"),
                )
                .await;
                break;
            }
            frame = source.next_frame() => frame,
        };

        match frame {
            None => break,
            Some(Err(e)) => {
                debug!(error = %e, connection_id = %socket.connection_id(), "stream read failed");
                break;
            }
            Some(Ok(InboundFrame::Closed)) => break,
            // Binary frames are ignored
            Some(Ok(InboundFrame::Binary(_))) => continue,
            Some(Ok(InboundFrame::Text(text))) => {
                match handle_frame(&ctx, &socket, text).await {
                    Ok(()) => {}
                    Err(violation) => {
                        ctx.metrics.policy_violations.inc();
                        info!(
                            connection_id = %socket.connection_id(),
                            reason = %violation,
                            "closing stream for policy violation"
                        );
                        let _ = tokio::time::timeout(
                            CLOSE_TIMEOUT,
                            socket.close(CloseCode::PolicyViolation, &violation),
                        )
                        .await;
                        break;
                    }
                }
            }
        }
    }

    hooks::after_disconnect(ctx.clone(), socket.clone()).await;
    ctx.metrics
        .active_connections
        .with_label_values(&[&kind_label])
        .dec();
    debug!(connection_id = %socket.connection_id(), "receive loop finished");
}

/// Process one text frame; `Err` carries the reason to close with 1008
async fn handle_frame(
    ctx: &Arc<RelayContext>,
    socket: &Arc<SocketState>,
    text: String,
) -> std::result::Result<(), String> {
    let len = text.len();
    let total = socket.note_received(len);
    let authenticated = socket.is_authenticated();

    if !authenticated && total > ctx.config.limits.max_bytes_before_authentication as u64 {
        return Err("Too much data received before authentication".to_string());
    }
    if authenticated && len > ctx.config.limits.max_message_size {
        return Err("Message exceeds the maximum size".to_string());
    }

    let envelope = match decode(ctx, socket, text.as_bytes()) {
        Ok(envelope) => envelope,
        Err(e) => return Err(e.to_string()),
    };

    // A token past its expiry ends the stream regardless of message type
    if let Some(expires) = socket.token_expiration() {
        if expires < Utc::now() {
            let warning = Envelope::new(MessageType::Warning).with_error("TokenExpired");
            if let Err(e) = socket.send(&warning, Seal::Plain).await {
                debug!(error = %e, "failed to send expiry warning");
            }
            return Err("TokenExpired".to_string());
        }
    }

    ctx.metrics
        .messages_received
        .with_label_values(&[envelope.kind.as_str()])
        .inc();

    match ctx
        .behaviors
        .dispatch(ctx.clone(), socket.clone(), envelope)
        .await
    {
        Ok(()) => Ok(()),
        Err(RelayError::PolicyViolation { reason }) => Err(reason),
        Err(e) => {
            // Behavior failures are isolated; the stream lives on
            warn!(
                error = %e,
                connection_id = %socket.connection_id(),
                "behavior failed"
            );
            Ok(())
        }
    }
}

fn decode(
    ctx: &Arc<RelayContext>,
    socket: &Arc<SocketState>,
    bytes: &[u8],
) -> crate::error::Result<Envelope> {
    let envelope = match socket.expected_wrapping() {
        Wrapping::PlainText => sealing::open_plain(bytes)?,
        // The agent auth request carries its own verification key
        Wrapping::SignOnly => sealing::open_signed_embedded(bytes)?,
        Wrapping::Encrypt => sealing::open_encrypted(bytes, &ctx.keys)?,
    };
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ConnectionState;
    use crate::testutil::{frame_channel, test_node, RecordingSink};
    use strand_config::NodeRole;
    use strand_protocol::WelcomePayload;

    #[tokio::test]
    async fn ingress_sends_welcome_and_disconnect_runs_hook() {
        let node = test_node(NodeRole::Service, "svc-1");
        let sink = RecordingSink::new();
        let socket = SocketState::new(
            ConnectionState::PortalUnauth,
            Box::new(sink.clone()),
            None,
        );
        node.ctx.directory.add_client(socket.clone());
        let (frames, source) = frame_channel();

        let loop_task = tokio::spawn(run_connection(
            node.ctx.clone(),
            socket,
            Box::new(source),
            StreamOrigin::Ingress,
        ));
        drop(frames);
        loop_task.await.unwrap();

        let welcome = &sink.sent_envelopes()[0];
        assert_eq!(welcome.kind, MessageType::Welcome);
        let payload: WelcomePayload = welcome.parse_payload().unwrap();
        assert_eq!(payload.machine_name, "svc-1");
        assert_eq!(node.ctx.directory.counts(), (0, 0));
    }

    #[tokio::test]
    async fn oversize_preauth_frame_closes_with_policy_violation() {
        let node = test_node(NodeRole::Service, "svc-1");
        let sink = RecordingSink::new();
        let socket = SocketState::new(
            ConnectionState::AgentUnauth,
            Box::new(sink.clone()),
            None,
        );
        let (frames, source) = frame_channel();

        let limit = node.ctx.config.limits.max_bytes_before_authentication;
        frames
            .send(InboundFrame::Text("x".repeat(limit + 1)))
            .unwrap();

        run_connection(
            node.ctx.clone(),
            socket,
            Box::new(source),
            StreamOrigin::Ingress,
        )
        .await;

        let (code, reason) = sink.closed().unwrap();
        assert_eq!(code, CloseCode::PolicyViolation);
        assert!(reason.contains("Too much data"));
    }

    #[tokio::test]
    async fn cumulative_preauth_bytes_are_bounded() {
        let node = test_node(NodeRole::Service, "svc-1");
        let sink = RecordingSink::new();
        let socket = SocketState::new(
            ConnectionState::PortalUnauth,
            Box::new(sink.clone()),
            None,
        );
        let (frames, source) = frame_channel();

        // Many well-formed small frames eventually breach the budget; the
        // type has no handler in this role table so each one is ignored
        let filler = Envelope::new(MessageType::AuthGateway).to_json().unwrap();
        let limit = node.ctx.config.limits.max_bytes_before_authentication;
        for _ in 0..=(limit / filler.len()) + 1 {
            frames.send(InboundFrame::Text(filler.clone())).unwrap();
        }

        run_connection(
            node.ctx.clone(),
            socket,
            Box::new(source),
            StreamOrigin::Ingress,
        )
        .await;

        let (code, reason) = sink.closed().unwrap();
        assert_eq!(code, CloseCode::PolicyViolation);
        assert!(reason.contains("Too much data"));
    }

    #[tokio::test]
    async fn wrong_wrapping_closes_the_stream() {
        let node = test_node(NodeRole::Service, "svc-1");
        let sink = RecordingSink::new();
        // Agent ingress expects Sign-Only; plain JSON must be rejected
        let socket = SocketState::new(
            ConnectionState::AgentUnauth,
            Box::new(sink.clone()),
            None,
        );
        let (frames, source) = frame_channel();
        frames
            .send(InboundFrame::Text(
                Envelope::new(MessageType::Ping).to_json().unwrap(),
            ))
            .unwrap();

        run_connection(
            node.ctx.clone(),
            socket,
            Box::new(source),
            StreamOrigin::Ingress,
        )
        .await;

        let (code, _) = sink.closed().unwrap();
        assert_eq!(code, CloseCode::PolicyViolation);
    }

    #[tokio::test]
    async fn expired_token_sends_warning_then_closes() {
        let node = test_node(NodeRole::Service, "svc-1");
        let sink = RecordingSink::new();
        let socket = SocketState::new(
            ConnectionState::PortalAuth,
            Box::new(sink.clone()),
            None,
        );
        socket.assign_identity("P1", "T1", None, None).unwrap();
        socket.set_token_expiration(Some(Utc::now() - chrono::Duration::minutes(1)));
        let (frames, source) = frame_channel();
        frames
            .send(InboundFrame::Text(
                Envelope::new(MessageType::Ping).from_id("P1").to_json().unwrap(),
            ))
            .unwrap();

        run_connection(
            node.ctx.clone(),
            socket,
            Box::new(source),
            StreamOrigin::Ingress,
        )
        .await;

        let envelopes = sink.sent_envelopes();
        let warning = envelopes
            .iter()
            .find(|e| e.kind == MessageType::Warning)
            .expect("no warning sent");
        assert_eq!(warning.error_message.as_deref(), Some("TokenExpired"));
        let (code, reason) = sink.closed().unwrap();
        assert_eq!(code, CloseCode::PolicyViolation);
        assert_eq!(reason, "TokenExpired");
    }

    #[tokio::test]
    async fn binary_frames_are_ignored() {
        let node = test_node(NodeRole::Service, "svc-1");
        let sink = RecordingSink::new();
        let socket = SocketState::new(
            ConnectionState::PortalUnauth,
            Box::new(sink.clone()),
            None,
        );
        let (frames, source) = frame_channel();
        frames.send(InboundFrame::Binary(vec![0xde, 0xad])).unwrap();
        drop(frames);

        run_connection(
            node.ctx.clone(),
            socket,
            Box::new(source),
            StreamOrigin::Ingress,
        )
        .await;
        assert!(sink.closed().is_none());
    }

    #[tokio::test]
    async fn empty_type_frame_is_logged_and_ignored() {
        let node = test_node(NodeRole::Gateway, "gw-1");
        let sink = RecordingSink::new();
        let socket = SocketState::new(
            ConnectionState::GatewayAuth,
            Box::new(sink.clone()),
            None,
        );
        socket.assign_peer_id("svc-1", "gateway").unwrap();
        let (frames, source) = frame_channel();
        // `welcome` has no handler in the gateway role table
        frames
            .send(InboundFrame::Text(
                Envelope::new(MessageType::Welcome).to_json().unwrap(),
            ))
            .unwrap();
        drop(frames);

        run_connection(
            node.ctx.clone(),
            socket,
            Box::new(source),
            StreamOrigin::Ingress,
        )
        .await;
        // Stream ended by channel-close, not by a violation
        assert!(sink.closed().is_none());
    }

    #[tokio::test]
    async fn shutdown_closes_streams_gracefully() {
        let node = test_node(NodeRole::Service, "svc-1");
        let sink = RecordingSink::new();
        let socket = SocketState::new(
            ConnectionState::PortalUnauth,
            Box::new(sink.clone()),
            None,
        );
        let (_frames, source) = frame_channel();

        let loop_task = tokio::spawn(run_connection(
            node.ctx.clone(),
            socket,
            Box::new(source),
            StreamOrigin::Ingress,
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        node.ctx.shutdown.trigger();
        loop_task.await.unwrap();

        let (code, _) = sink.closed().unwrap();
        assert_eq!(code, CloseCode::Normal);
    }
}
