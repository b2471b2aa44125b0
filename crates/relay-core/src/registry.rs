//! Tenant registry adapter
//!
//! The durable state store tracking which tenants' clients live where is an
//! external collaborator; this module defines the narrow interface the
//! engine needs plus the in-process implementation used when
//! `in_memory_client_list` is set (and by the test suite).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use strand_protocol::{ClientKind, ClientRegistration};

use crate::error::Result;

/// Parameters for a register (create-or-update) call
#[derive(Debug, Clone)]
pub struct Registration {
    pub kind: ClientKind,
    pub connection_id: Uuid,
    pub client_id: String,
    pub organization_id: String,
    pub registered_agent_id: Option<String>,
    pub client_version: Option<String>,
    /// Instance id of the node terminating this client
    pub gateway_id: Option<String>,
    pub client_ip: Option<String>,
}

/// The registry operations the engine relies on; all tenant-scoped
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Create or update; keyed on `(organization_id, client_id)`
    async fn register(&self, registration: Registration) -> Result<bool>;

    /// Bump `last_updated_on`; `false` when the row does not exist
    async fn update_activity(&self, client_id: &str, organization_id: &str) -> Result<bool>;

    /// Remove a row; idempotent, returns `true` even when the row is absent
    async fn deregister(
        &self,
        connection_id: Uuid,
        client_id: &str,
        organization_id: &str,
        bytes_received: u64,
        bytes_sent: u64,
    ) -> Result<bool>;

    /// Active agents of a tenant (rows younger than the liveness window)
    async fn agents(&self, organization_id: &str) -> Result<Vec<ClientRegistration>>;

    /// Active portals of a tenant
    async fn portals(&self, organization_id: &str) -> Result<Vec<ClientRegistration>>;

    /// Remove rows older than the retention window; returns how many
    async fn purge_stale(&self) -> Result<usize>;
}

struct Row {
    registration: ClientRegistration,
    connection_id: Uuid,
    bytes_received: u64,
    bytes_sent: u64,
}

/// In-process registry
pub struct InMemoryRegistry {
    rows: Mutex<HashMap<(String, String), Row>>,
    inactivity_window: Duration,
    retention: Duration,
}

impl InMemoryRegistry {
    /// Standard windows: 5-minute liveness, 1-day retention
    pub fn new() -> Self {
        Self::with_windows(Duration::from_secs(5 * 60), Duration::from_secs(24 * 60 * 60))
    }

    /// Custom windows, driven by configuration
    pub fn with_windows(inactivity_window: Duration, retention: Duration) -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            inactivity_window,
            retention,
        }
    }

    fn active_of_kind(&self, organization_id: &str, kind: ClientKind) -> Vec<ClientRegistration> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.inactivity_window)
                .unwrap_or_else(|_| chrono::Duration::zero());
        self.rows
            .lock()
            .expect("registry lock poisoned")
            .values()
            .filter(|row| {
                row.registration.organization_id == organization_id
                    && row.registration.kind == kind
                    && row.registration.last_updated_on >= cutoff
            })
            .map(|row| row.registration.clone())
            .collect()
    }

    /// Total row count, stale rows included
    pub fn len(&self) -> usize {
        self.rows.lock().expect("registry lock poisoned").len()
    }

    /// True when no rows are stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, organization_id: &str, client_id: &str, age: Duration) {
        let mut rows = self.rows.lock().expect("registry lock poisoned");
        if let Some(row) = rows.get_mut(&(organization_id.to_string(), client_id.to_string())) {
            row.registration.last_updated_on = Utc::now()
                - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
        }
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryStore for InMemoryRegistry {
    async fn register(&self, registration: Registration) -> Result<bool> {
        let key = (
            registration.organization_id.clone(),
            registration.client_id.clone(),
        );
        let mut rows = self.rows.lock().expect("registry lock poisoned");
        let row = Row {
            registration: ClientRegistration {
                client_id: registration.client_id,
                organization_id: registration.organization_id,
                kind: registration.kind,
                machine_registration_id: registration.registered_agent_id,
                client_version: registration.client_version,
                gateway_id: registration.gateway_id,
                last_updated_on: Utc::now(),
            },
            connection_id: registration.connection_id,
            bytes_received: 0,
            bytes_sent: 0,
        };
        rows.insert(key, row);
        Ok(true)
    }

    async fn update_activity(&self, client_id: &str, organization_id: &str) -> Result<bool> {
        let mut rows = self.rows.lock().expect("registry lock poisoned");
        match rows.get_mut(&(organization_id.to_string(), client_id.to_string())) {
            Some(row) => {
                row.registration.last_updated_on = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn deregister(
        &self,
        connection_id: Uuid,
        client_id: &str,
        organization_id: &str,
        bytes_received: u64,
        bytes_sent: u64,
    ) -> Result<bool> {
        let mut rows = self.rows.lock().expect("registry lock poisoned");
        let key = (organization_id.to_string(), client_id.to_string());
        if let Some(row) = rows.get_mut(&key) {
            // A newer stream may have re-registered the same identity; only
            // the owning connection removes the row.
            if row.connection_id == connection_id {
                row.bytes_received = bytes_received;
                row.bytes_sent = bytes_sent;
                rows.remove(&key);
            }
        }
        Ok(true)
    }

    async fn agents(&self, organization_id: &str) -> Result<Vec<ClientRegistration>> {
        Ok(self.active_of_kind(organization_id, ClientKind::Agent))
    }

    async fn portals(&self, organization_id: &str) -> Result<Vec<ClientRegistration>> {
        Ok(self.active_of_kind(organization_id, ClientKind::Portal))
    }

    async fn purge_stale(&self) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.retention)
                .unwrap_or_else(|_| chrono::Duration::zero());
        let mut rows = self.rows.lock().expect("registry lock poisoned");
        let before = rows.len();
        rows.retain(|_, row| row.registration.last_updated_on >= cutoff);
        Ok(before - rows.len())
    }
}
