//! Per-stream connection object
//!
//! A [`SocketState`] carries everything the engine knows about one stream:
//! identity, state machine position, key material, byte counters and the
//! single-writer guard that serializes outbound frames.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use strand_protocol::{sealing, ClientKind, Envelope, NodeKeyPair, PeerPublicKey, Wrapping};

use crate::error::{RelayError, Result};
use crate::interest::RecentInterestMap;
use crate::state::ConnectionState;
use crate::transport::{CloseCode, FrameSink};

/// How an outbound envelope is sealed
pub enum Seal {
    Plain,
    Signed(Arc<NodeKeyPair>),
    Encrypted(PeerPublicKey),
}

/// Mutable identity assigned during authentication
#[derive(Debug, Default, Clone)]
struct Identity {
    client_id: Option<String>,
    organization_id: Option<String>,
    registered_agent_id: Option<String>,
    client_version: Option<String>,
}

/// Everything the node tracks for one attached stream
pub struct SocketState {
    connection_id: Uuid,
    state: RwLock<ConnectionState>,
    identity: RwLock<Identity>,
    impersonated: AtomicBool,
    peer_public_key: RwLock<Option<PeerPublicKey>>,
    /// Nonce this node issued in its gateway `welcome`
    handshake_nonce: RwLock<Option<Vec<u8>>>,
    token_expiration: RwLock<Option<DateTime<Utc>>>,
    connected_on: DateTime<Utc>,
    last_received_ms: AtomicI64,
    last_sent_ms: AtomicI64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    client_ip: Option<String>,
    /// Exclusive writer; two concurrent sends never interleave on the wire
    writer: Mutex<Box<dyn FrameSink>>,
    /// Return-path interest; consulted only on gateway-kind connections
    interest: RecentInterestMap,
}

impl SocketState {
    /// Attach a new stream in the given initial state
    pub fn new(
        initial_state: ConnectionState,
        sink: Box<dyn FrameSink>,
        client_ip: Option<String>,
    ) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            connection_id: Uuid::new_v4(),
            state: RwLock::new(initial_state),
            identity: RwLock::new(Identity::default()),
            impersonated: AtomicBool::new(false),
            peer_public_key: RwLock::new(None),
            handshake_nonce: RwLock::new(None),
            token_expiration: RwLock::new(None),
            connected_on: now,
            last_received_ms: AtomicI64::new(now.timestamp_millis()),
            last_sent_ms: AtomicI64::new(now.timestamp_millis()),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            client_ip,
            writer: Mutex::new(sink),
            interest: RecentInterestMap::new(),
        })
    }

    /// Node-local opaque id of this stream
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Current state machine position
    pub fn state(&self) -> ConnectionState {
        *self.state.read().expect("socket state lock poisoned")
    }

    /// Transition to a new state
    pub fn set_state(&self, state: ConnectionState) {
        let mut guard = self.state.write().expect("socket state lock poisoned");
        debug!(
            connection_id = %self.connection_id,
            old_state = ?*guard,
            new_state = ?state,
            "connection state transition"
        );
        *guard = state;
    }

    /// Client category derived from the current state
    pub fn kind(&self) -> ClientKind {
        self.state().client_kind()
    }

    /// True once this stream has authenticated
    pub fn is_authenticated(&self) -> bool {
        self.state().is_authenticated()
    }

    /// Wrapping inbound frames must carry right now
    pub fn expected_wrapping(&self) -> Wrapping {
        self.state().expected_wrapping()
    }

    /// Identity set at authentication; `None` before
    pub fn client_id(&self) -> Option<String> {
        self.identity
            .read()
            .expect("identity lock poisoned")
            .client_id
            .clone()
    }

    /// Tenant set at authentication; `None` before
    pub fn organization_id(&self) -> Option<String> {
        self.identity
            .read()
            .expect("identity lock poisoned")
            .organization_id
            .clone()
    }

    /// Durable agent registration id, when known
    pub fn registered_agent_id(&self) -> Option<String> {
        self.identity
            .read()
            .expect("identity lock poisoned")
            .registered_agent_id
            .clone()
    }

    /// Client-reported version string
    pub fn client_version(&self) -> Option<String> {
        self.identity
            .read()
            .expect("identity lock poisoned")
            .client_version
            .clone()
    }

    /// Assign identity at authentication
    ///
    /// Re-authentication may refresh every field except the tenant: once an
    /// organization id is set it never changes for the life of the stream.
    pub fn assign_identity(
        &self,
        client_id: &str,
        organization_id: &str,
        registered_agent_id: Option<String>,
        client_version: Option<String>,
    ) -> Result<()> {
        if client_id.is_empty() || organization_id.is_empty() {
            return Err(RelayError::policy("Authentication produced an empty identity"));
        }
        let mut identity = self.identity.write().expect("identity lock poisoned");
        if let Some(existing) = &identity.organization_id {
            if existing != organization_id {
                return Err(RelayError::policy(
                    "Re-authentication must not change the tenant",
                ));
            }
        }
        identity.client_id = Some(client_id.to_string());
        identity.organization_id = Some(organization_id.to_string());
        identity.registered_agent_id = registered_agent_id;
        identity.client_version = client_version;
        Ok(())
    }

    /// Set only the peer id; used by the gateway handshake
    pub fn assign_peer_id(&self, client_id: &str, organization_id: &str) -> Result<()> {
        self.assign_identity(client_id, organization_id, None, None)
    }

    /// Flag set by the authenticator for impersonated portal sessions
    pub fn impersonated(&self) -> bool {
        self.impersonated.load(Ordering::Relaxed)
    }

    /// Mark this stream as impersonated
    pub fn set_impersonated(&self, value: bool) {
        self.impersonated.store(value, Ordering::Relaxed);
    }

    /// Public key presented by the agent during authentication
    pub fn peer_public_key(&self) -> Option<PeerPublicKey> {
        self.peer_public_key
            .read()
            .expect("peer key lock poisoned")
            .clone()
    }

    /// Store the agent's public key; flips the inbound wrapping expectation
    pub fn set_peer_public_key(&self, key: PeerPublicKey) {
        *self.peer_public_key.write().expect("peer key lock poisoned") = Some(key);
    }

    /// Nonce issued in this node's gateway `welcome`
    pub fn handshake_nonce(&self) -> Option<Vec<u8>> {
        self.handshake_nonce
            .read()
            .expect("nonce lock poisoned")
            .clone()
    }

    /// Remember the nonce issued in the gateway `welcome`
    pub fn set_handshake_nonce(&self, nonce: Vec<u8>) {
        *self.handshake_nonce.write().expect("nonce lock poisoned") = Some(nonce);
    }

    /// Token expiry as asserted by the validator
    pub fn token_expiration(&self) -> Option<DateTime<Utc>> {
        *self
            .token_expiration
            .read()
            .expect("token expiration lock poisoned")
    }

    /// Record the token expiry returned by the validator
    pub fn set_token_expiration(&self, expires: Option<DateTime<Utc>>) {
        *self
            .token_expiration
            .write()
            .expect("token expiration lock poisoned") = expires;
    }

    /// Moment the stream attached
    pub fn connected_on(&self) -> DateTime<Utc> {
        self.connected_on
    }

    /// Timestamp of the last inbound frame
    pub fn last_received(&self) -> DateTime<Utc> {
        millis_to_utc(self.last_received_ms.load(Ordering::Relaxed))
    }

    /// Timestamp of the last outbound frame
    pub fn last_sent(&self) -> DateTime<Utc> {
        millis_to_utc(self.last_sent_ms.load(Ordering::Relaxed))
    }

    /// Total bytes received on this stream
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Total bytes sent on this stream
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Remote address as reported by the acceptor
    pub fn client_ip(&self) -> Option<&str> {
        self.client_ip.as_deref()
    }

    /// Account for an inbound frame; returns the new cumulative total
    pub fn note_received(&self, len: usize) -> u64 {
        self.last_received_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.bytes_received
            .fetch_add(len as u64, Ordering::Relaxed)
            .wrapping_add(len as u64)
    }

    /// Return-path interest recorded against this connection
    pub fn interest(&self) -> &RecentInterestMap {
        &self.interest
    }

    /// Seal and send one envelope as a single text frame
    ///
    /// Holds the write guard for the whole operation so concurrent callers
    /// are linearized.
    pub async fn send(&self, envelope: &Envelope, seal: Seal) -> Result<()> {
        let bytes = match &seal {
            Seal::Plain => sealing::seal_plain(envelope)?,
            Seal::Signed(keys) => sealing::seal_signed(envelope, keys)?,
            Seal::Encrypted(recipient) => sealing::seal_encrypted(envelope, recipient)?,
        };
        let text = String::from_utf8(bytes)
            .map_err(|_| RelayError::transport("sealed frame is not UTF-8"))?;

        let mut writer = self.writer.lock().await;
        writer.send_text(text.clone()).await?;
        self.bytes_sent
            .fetch_add(text.len() as u64, Ordering::Relaxed);
        self.last_sent_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        Ok(())
    }

    /// Close the stream with the given code and reason
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.close(code, reason).await
    }
}

impl std::fmt::Debug for SocketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketState")
            .field("connection_id", &self.connection_id)
            .field("state", &self.state())
            .field("client_id", &self.client_id())
            .field("organization_id", &self.organization_id())
            .finish_non_exhaustive()
    }
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}
