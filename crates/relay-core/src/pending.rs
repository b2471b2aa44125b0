//! Pending-response correlator
//!
//! Control requests relayed toward an agent wait here for the matching
//! response. Keys are tenant-scoped so two tenants can never complete each
//! other's requests. Delivery is single-shot: the first `complete` wins,
//! duplicates and completions after cancellation are no-ops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use strand_protocol::ControlResponse;

/// Correlation key: `(tenant, client, messageId)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub organization_id: String,
    pub client_id: String,
    pub message_id: String,
}

impl PendingKey {
    pub fn new(
        organization_id: impl Into<String>,
        client_id: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            client_id: client_id.into(),
            message_id: message_id.into(),
        }
    }
}

/// Outcome of awaiting a pending response
#[derive(Debug)]
pub enum PendingOutcome {
    /// The matching response arrived in time
    Completed(ControlResponse),
    /// The deadline elapsed first
    TimedOut,
}

struct Slot {
    generation: u64,
    sender: oneshot::Sender<ControlResponse>,
}

type Registry = Arc<Mutex<HashMap<PendingKey, Slot>>>;

/// The correlator shared by behaviors and the bus intake
pub struct PendingResponses {
    inner: Registry,
    generation: AtomicU64,
}

impl PendingResponses {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Register a suspender for `key` with the given deadline
    ///
    /// The returned ticket removes the entry when dropped, so an abandoned
    /// or timed-out wait never leaks its slot. A second `prepare` under the
    /// same key displaces the first; the displaced waiter observes a
    /// timeout-equivalent cancellation.
    pub fn prepare(&self, key: PendingKey, deadline: Duration) -> PendingTicket {
        let (tx, rx) = oneshot::channel();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut map = self.inner.lock().expect("pending map lock poisoned");
            map.insert(
                key.clone(),
                Slot {
                    generation,
                    sender: tx,
                },
            );
        }
        PendingTicket {
            key,
            generation,
            rx,
            deadline,
            registry: Arc::clone(&self.inner),
        }
    }

    /// Complete the suspender registered under `key`, if any
    ///
    /// Returns `true` when a waiter was fulfilled. Completing an absent or
    /// already-completed key is a no-op.
    pub fn complete(&self, key: &PendingKey, response: ControlResponse) -> bool {
        let slot = {
            let mut map = self.inner.lock().expect("pending map lock poisoned");
            map.remove(key)
        };
        match slot {
            // The oneshot wakes the waiting task on its executor; nothing
            // user-visible runs while the map lock is held.
            Some(slot) => slot.sender.send(response).is_ok(),
            None => {
                debug!(?key, "no pending response registered");
                false
            }
        }
    }

    /// Number of unresolved entries
    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending map lock poisoned").len()
    }

    /// True when nothing is pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PendingResponses {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered wait for one response
pub struct PendingTicket {
    key: PendingKey,
    generation: u64,
    rx: oneshot::Receiver<ControlResponse>,
    deadline: Duration,
    registry: Registry,
}

impl PendingTicket {
    /// Await the response or the deadline, whichever comes first
    pub async fn wait(mut self) -> PendingOutcome {
        match tokio::time::timeout(self.deadline, &mut self.rx).await {
            Ok(Ok(response)) => PendingOutcome::Completed(response),
            // Sender dropped (displaced entry) or deadline elapsed; Drop
            // clears the slot if it is still ours.
            Ok(Err(_)) | Err(_) => PendingOutcome::TimedOut,
        }
    }
}

impl Drop for PendingTicket {
    fn drop(&mut self) {
        let mut map = self.registry.lock().expect("pending map lock poisoned");
        if map
            .get(&self.key)
            .is_some_and(|slot| slot.generation == self.generation)
        {
            map.remove(&self.key);
        }
    }
}
