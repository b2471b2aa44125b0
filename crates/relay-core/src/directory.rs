//! Directory of locally-attached connections
//!
//! Two separate lists: client connections (Portals and Agents) and
//! gateway-kind connections (outward dials on a Service node, inbound
//! Service streams on a Gateway node). Snapshots are returned by copy so
//! callers iterate without holding the lock.

use std::sync::{Arc, Mutex};

use uuid::Uuid;

use strand_protocol::ClientKind;

use crate::socket::SocketState;
use crate::state::ConnectionState;

/// Thread-safe registry of the streams attached to this node
pub struct ConnectionDirectory {
    clients: Mutex<Vec<Arc<SocketState>>>,
    gateways: Mutex<Vec<Arc<SocketState>>>,
}

impl ConnectionDirectory {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(Vec::new()),
            gateways: Mutex::new(Vec::new()),
        }
    }

    /// Track a Portal or Agent stream
    pub fn add_client(&self, socket: Arc<SocketState>) {
        self.clients
            .lock()
            .expect("client directory lock poisoned")
            .push(socket);
    }

    /// Track a gateway-kind stream
    pub fn add_gateway(&self, socket: Arc<SocketState>) {
        self.gateways
            .lock()
            .expect("gateway directory lock poisoned")
            .push(socket);
    }

    /// Stop tracking a stream, wherever it lives
    pub fn remove(&self, connection_id: Uuid) {
        self.clients
            .lock()
            .expect("client directory lock poisoned")
            .retain(|s| s.connection_id() != connection_id);
        self.gateways
            .lock()
            .expect("gateway directory lock poisoned")
            .retain(|s| s.connection_id() != connection_id);
    }

    /// Copy of the client list
    pub fn clients(&self) -> Vec<Arc<SocketState>> {
        self.clients
            .lock()
            .expect("client directory lock poisoned")
            .clone()
    }

    /// Copy of the gateway list
    pub fn gateways(&self) -> Vec<Arc<SocketState>> {
        self.gateways
            .lock()
            .expect("gateway directory lock poisoned")
            .clone()
    }

    /// First client connection matching the predicate
    pub fn first_client_where<F>(&self, predicate: F) -> Option<Arc<SocketState>>
    where
        F: Fn(&SocketState) -> bool,
    {
        self.clients
            .lock()
            .expect("client directory lock poisoned")
            .iter()
            .find(|s| predicate(s))
            .cloned()
    }

    /// The locally-attached, authenticated agent with this identity
    pub fn find_agent(&self, organization_id: &str, client_id: &str) -> Option<Arc<SocketState>> {
        self.first_client_where(|s| {
            s.state() == ConnectionState::AgentAuth
                && s.kind() == ClientKind::Agent
                && s.client_id().as_deref() == Some(client_id)
                && s.organization_id().as_deref() == Some(organization_id)
        })
    }

    /// The locally-attached, authenticated portal with this identity
    pub fn find_portal(&self, organization_id: &str, client_id: &str) -> Option<Arc<SocketState>> {
        self.first_client_where(|s| {
            s.state() == ConnectionState::PortalAuth
                && s.client_id().as_deref() == Some(client_id)
                && s.organization_id().as_deref() == Some(organization_id)
        })
    }

    /// All authenticated portals of a tenant
    pub fn portals_of(&self, organization_id: &str) -> Vec<Arc<SocketState>> {
        self.clients
            .lock()
            .expect("client directory lock poisoned")
            .iter()
            .filter(|s| {
                s.state() == ConnectionState::PortalAuth
                    && s.organization_id().as_deref() == Some(organization_id)
            })
            .cloned()
            .collect()
    }

    /// The authenticated gateway peer with this instance id
    pub fn find_gateway(&self, instance_id: &str) -> Option<Arc<SocketState>> {
        self.gateways
            .lock()
            .expect("gateway directory lock poisoned")
            .iter()
            .find(|s| {
                s.state() == ConnectionState::GatewayAuth
                    && s.client_id().as_deref() == Some(instance_id)
            })
            .cloned()
    }

    /// Authenticated gateway peers whose interest map holds `(tenant, client)`
    pub fn gateways_relevant_to(
        &self,
        organization_id: &str,
        client_id: &str,
    ) -> Vec<Arc<SocketState>> {
        self.gateways
            .lock()
            .expect("gateway directory lock poisoned")
            .iter()
            .filter(|s| {
                s.state() == ConnectionState::GatewayAuth
                    && s.interest().contains(organization_id, client_id)
            })
            .cloned()
            .collect()
    }

    /// Counts of (clients, gateways) currently tracked
    pub fn counts(&self) -> (usize, usize) {
        (
            self.clients
                .lock()
                .expect("client directory lock poisoned")
                .len(),
            self.gateways
                .lock()
                .expect("gateway directory lock poisoned")
                .len(),
        )
    }
}

impl Default for ConnectionDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::RecordingSink;

    fn socket(state: ConnectionState) -> Arc<SocketState> {
        SocketState::new(state, Box::new(RecordingSink::new()), None)
    }

    fn authed(state: ConnectionState, client_id: &str, org: &str) -> Arc<SocketState> {
        let s = socket(state);
        s.assign_identity(client_id, org, None, None).unwrap();
        s
    }

    #[test]
    fn add_remove_and_snapshot() {
        let dir = ConnectionDirectory::new();
        let a = authed(ConnectionState::AgentAuth, "A1", "T1");
        let p = authed(ConnectionState::PortalAuth, "P1", "T1");
        dir.add_client(a.clone());
        dir.add_client(p);
        assert_eq!(dir.counts(), (2, 0));

        dir.remove(a.connection_id());
        assert_eq!(dir.counts(), (1, 0));
    }

    #[test]
    fn find_agent_is_tenant_scoped() {
        let dir = ConnectionDirectory::new();
        dir.add_client(authed(ConnectionState::AgentAuth, "A1", "T1"));

        assert!(dir.find_agent("T1", "A1").is_some());
        assert!(dir.find_agent("T2", "A1").is_none());
        assert!(dir.find_agent("T1", "A2").is_none());
    }

    #[test]
    fn unauthenticated_agent_is_not_found() {
        let dir = ConnectionDirectory::new();
        dir.add_client(socket(ConnectionState::AgentUnauth));
        assert!(dir.find_agent("T1", "A1").is_none());
    }

    #[test]
    fn relevant_gateways_require_auth_and_interest() {
        let dir = ConnectionDirectory::new();
        let authed_gw = authed(ConnectionState::GatewayAuth, "gw-1", "-");
        let unauth_gw = socket(ConnectionState::GatewayUnauth);
        authed_gw.interest().mark("T1", "A1");
        unauth_gw.interest().mark("T1", "A1");
        dir.add_gateway(authed_gw.clone());
        dir.add_gateway(unauth_gw);

        let relevant = dir.gateways_relevant_to("T1", "A1");
        assert_eq!(relevant.len(), 1);
        assert_eq!(relevant[0].connection_id(), authed_gw.connection_id());
        assert!(dir.gateways_relevant_to("T1", "A2").is_empty());
    }

    #[test]
    fn portals_of_filters_tenant() {
        let dir = ConnectionDirectory::new();
        dir.add_client(authed(ConnectionState::PortalAuth, "P1", "T1"));
        dir.add_client(authed(ConnectionState::PortalAuth, "P2", "T2"));
        let portals = dir.portals_of("T1");
        assert_eq!(portals.len(), 1);
        assert_eq!(portals[0].client_id().as_deref(), Some("P1"));
    }
}
