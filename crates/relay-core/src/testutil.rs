//! In-memory doubles for exercising the engine without sockets or a bus
//!
//! Used by this crate's own tests and by downstream integration tests; no
//! production code path depends on this module.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use tokio::sync::mpsc;

use strand_config::{NodeRole, RelayConfig};
use strand_protocol::{Envelope, NodeKeyPair};

use crate::context::RelayContext;
use crate::error::Result;
use crate::metrics::RelayMetrics;
use crate::ports::{
    AgentActivityMessage, EventBus, PublicKeyAnnouncement, TokenValidation, TokenValidator,
};
use crate::registry::InMemoryRegistry;
use crate::shutdown::Shutdown;
use crate::transport::{CloseCode, FrameSink, FrameSource, InboundFrame};

/// A sink that records everything written to it
#[derive(Clone)]
pub struct RecordingSink {
    inner: Arc<Mutex<SinkLog>>,
}

#[derive(Default)]
struct SinkLog {
    sent: Vec<String>,
    closed: Option<(CloseCode, String)>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SinkLog::default())),
        }
    }

    /// Raw frames written so far
    pub fn sent(&self) -> Vec<String> {
        self.inner.lock().expect("sink log poisoned").sent.clone()
    }

    /// Frames parsed as plain-text envelopes; panics on sealed frames
    pub fn sent_envelopes(&self) -> Vec<Envelope> {
        self.sent()
            .iter()
            .map(|raw| Envelope::from_json(raw).expect("frame is not a plain envelope"))
            .collect()
    }

    /// Close frame observed, if any
    pub fn closed(&self) -> Option<(CloseCode, String)> {
        self.inner.lock().expect("sink log poisoned").closed.clone()
    }
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.inner.lock().expect("sink log poisoned").sent.push(text);
        Ok(())
    }

    async fn close(&mut self, code: CloseCode, reason: &str) -> Result<()> {
        self.inner.lock().expect("sink log poisoned").closed = Some((code, reason.to_string()));
        Ok(())
    }
}

/// A source fed by a channel of scripted frames
pub struct ScriptedSource {
    rx: mpsc::UnboundedReceiver<InboundFrame>,
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn next_frame(&mut self) -> Option<Result<InboundFrame>> {
        self.rx.recv().await.map(Ok)
    }
}

/// Create a scripted frame source plus the handle that feeds it
pub fn frame_channel() -> (mpsc::UnboundedSender<InboundFrame>, ScriptedSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, ScriptedSource { rx })
}

/// A validator backed by a static token table
pub struct StaticValidator {
    tokens: Mutex<HashMap<String, TokenValidation>>,
}

impl StaticValidator {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Accept `token` with the given outcome
    pub fn insert(&self, token: impl Into<String>, validation: TokenValidation) {
        self.tokens
            .lock()
            .expect("validator table poisoned")
            .insert(token.into(), validation);
    }

    /// Shorthand for a token accepted into `organization_id`
    pub fn accept(&self, token: impl Into<String>, organization_id: &str) {
        self.insert(
            token,
            TokenValidation {
                success: true,
                organization_id: Some(organization_id.to_string()),
                registered_agent_id: None,
                expires: Some(chrono::Utc::now() + chrono::Duration::hours(1)),
                new_token: None,
                message: None,
                impersonated: false,
            },
        );
    }

    fn lookup(&self, token: &str) -> TokenValidation {
        self.tokens
            .lock()
            .expect("validator table poisoned")
            .get(token)
            .cloned()
            .unwrap_or_else(|| TokenValidation::rejected("unknown token"))
    }
}

impl Default for StaticValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenValidator for StaticValidator {
    async fn validate_portal_token(&self, token: &str) -> Result<TokenValidation> {
        Ok(self.lookup(token))
    }

    async fn validate_agent_token(&self, token: &str) -> Result<TokenValidation> {
        Ok(self.lookup(token))
    }
}

/// A bus that records everything published to it
#[derive(Clone, Default)]
pub struct RecordingBus {
    activities: Arc<Mutex<Vec<AgentActivityMessage>>>,
    announcements: Arc<Mutex<Vec<PublicKeyAnnouncement>>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activities(&self) -> Vec<AgentActivityMessage> {
        self.activities.lock().expect("bus log poisoned").clone()
    }

    pub fn announcements(&self) -> Vec<PublicKeyAnnouncement> {
        self.announcements.lock().expect("bus log poisoned").clone()
    }
}

#[async_trait]
impl EventBus for RecordingBus {
    async fn publish_activity(&self, message: AgentActivityMessage) -> Result<()> {
        self.activities
            .lock()
            .expect("bus log poisoned")
            .push(message);
        Ok(())
    }

    async fn publish_public_key(&self, announcement: PublicKeyAnnouncement) -> Result<()> {
        self.announcements
            .lock()
            .expect("bus log poisoned")
            .push(announcement);
        Ok(())
    }
}

/// Shared RSA key pair; generation is slow, so tests amortize one
pub fn test_keys() -> Arc<NodeKeyPair> {
    static KEYS: OnceLock<Arc<NodeKeyPair>> = OnceLock::new();
    Arc::clone(KEYS.get_or_init(|| Arc::new(NodeKeyPair::generate().expect("key generation"))))
}

/// A second key pair, distinct from [`test_keys`]
pub fn other_test_keys() -> Arc<NodeKeyPair> {
    static KEYS: OnceLock<Arc<NodeKeyPair>> = OnceLock::new();
    Arc::clone(KEYS.get_or_init(|| Arc::new(NodeKeyPair::generate().expect("key generation"))))
}

/// Handles onto the doubles inside a test context
pub struct TestNode {
    pub ctx: Arc<RelayContext>,
    pub validator: Arc<StaticValidator>,
    pub bus: RecordingBus,
    pub registry: Arc<InMemoryRegistry>,
}

/// Build a fully in-memory node context
pub fn test_node(role: NodeRole, instance_id: &str) -> TestNode {
    let config = RelayConfig::from_toml(&format!(
        r#"
        role = "{role}"
        instance_id = "{instance_id}"

        [gateway]
        pre_shared_key = "test-psk"
        "#
    ))
    .expect("test config");

    let validator = Arc::new(StaticValidator::new());
    let bus = RecordingBus::new();
    let registry = Arc::new(InMemoryRegistry::new());
    let ctx = RelayContext::new(
        Arc::new(config),
        test_keys(),
        registry.clone(),
        validator.clone(),
        Arc::new(bus.clone()),
        Arc::new(RelayMetrics::new().expect("metrics")),
        Shutdown::new(),
    );
    TestNode {
        ctx,
        validator,
        bus,
        registry,
    }
}
