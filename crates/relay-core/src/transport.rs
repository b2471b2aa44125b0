//! Frame transport abstraction
//!
//! The relay engine is transport-agnostic: server ingress adapts an accepted
//! WebSocket, and the outbound gateway keeper adapts a dialed client stream.
//! Both sides reduce to a sink of text frames and a source of inbound frames.

use async_trait::async_trait;

use crate::error::Result;

/// WebSocket close codes the engine uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000
    Normal,
    /// 1008
    PolicyViolation,
}

impl CloseCode {
    /// Numeric wire value
    pub fn code(&self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::PolicyViolation => 1008,
        }
    }
}

/// One inbound frame after reassembly
#[derive(Debug, Clone)]
pub enum InboundFrame {
    /// A complete text message
    Text(String),
    /// A binary message; the engine ignores these
    Binary(Vec<u8>),
    /// The peer sent a close frame
    Closed,
}

/// Write half of a stream
#[async_trait]
pub trait FrameSink: Send {
    /// Send one complete text frame
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Send a close frame with the given code and reason
    async fn close(&mut self, code: CloseCode, reason: &str) -> Result<()>;
}

/// Read half of a stream
#[async_trait]
pub trait FrameSource: Send {
    /// Next reassembled frame; `None` when the stream has ended
    async fn next_frame(&mut self) -> Option<Result<InboundFrame>>;
}
