//! Adapters from an accepted axum WebSocket onto the engine's frame traits

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};

use strand_relay_core::{CloseCode, FrameSink, FrameSource, InboundFrame, RelayError};

/// Write half of an accepted stream
pub struct IngressSink {
    inner: SplitSink<WebSocket, Message>,
}

/// Read half of an accepted stream
pub struct IngressSource {
    inner: SplitStream<WebSocket>,
}

/// Split an accepted WebSocket into engine-facing halves
pub fn split(socket: WebSocket) -> (IngressSink, IngressSource) {
    let (sink, source) = socket.split();
    (IngressSink { inner: sink }, IngressSource { inner: source })
}

#[async_trait]
impl FrameSink for IngressSink {
    async fn send_text(&mut self, text: String) -> Result<(), RelayError> {
        self.inner
            .send(Message::Text(text))
            .await
            .map_err(|e| RelayError::Transport(format!("websocket send failed: {e}")))
    }

    async fn close(&mut self, code: CloseCode, reason: &str) -> Result<(), RelayError> {
        self.inner
            .send(Message::Close(Some(CloseFrame {
                code: code.code(),
                reason: reason.to_string().into(),
            })))
            .await
            .map_err(|e| RelayError::Transport(format!("websocket close failed: {e}")))
    }
}

#[async_trait]
impl FrameSource for IngressSource {
    async fn next_frame(&mut self) -> Option<Result<InboundFrame, RelayError>> {
        loop {
            return match self.inner.next().await? {
                Ok(Message::Text(text)) => Some(Ok(InboundFrame::Text(text))),
                Ok(Message::Binary(bytes)) => Some(Ok(InboundFrame::Binary(bytes))),
                Ok(Message::Close(_)) => Some(Ok(InboundFrame::Closed)),
                // Transport-level ping/pong is answered by axum itself
                Ok(_) => continue,
                Err(e) => Some(Err(RelayError::Transport(format!(
                    "websocket read failed: {e}"
                )))),
            };
        }
    }
}
