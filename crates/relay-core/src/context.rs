//! Shared collaborator set for the relay engine
//!
//! All collaborators are built once at startup and handed to behaviors,
//! loops and workers by reference; none of them reach back into the
//! behaviors, which keeps the service graph acyclic.

use std::sync::Arc;

use strand_config::{NodeRole, RelayConfig};
use strand_protocol::NodeKeyPair;

use crate::behaviors::BehaviorSet;
use crate::directory::ConnectionDirectory;
use crate::metrics::RelayMetrics;
use crate::pending::PendingResponses;
use crate::ports::{EventBus, TokenValidator};
use crate::registry::RegistryStore;
use crate::shutdown::Shutdown;

/// Everything a behavior or worker needs to do its job
pub struct RelayContext {
    pub config: Arc<RelayConfig>,
    pub keys: Arc<NodeKeyPair>,
    pub directory: Arc<ConnectionDirectory>,
    pub registry: Arc<dyn RegistryStore>,
    pub validator: Arc<dyn TokenValidator>,
    pub bus: Arc<dyn EventBus>,
    pub pending: Arc<PendingResponses>,
    pub metrics: Arc<RelayMetrics>,
    pub shutdown: Shutdown,
    pub behaviors: BehaviorSet,
}

impl RelayContext {
    /// Assemble a context for the role selected in `config`
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<RelayConfig>,
        keys: Arc<NodeKeyPair>,
        registry: Arc<dyn RegistryStore>,
        validator: Arc<dyn TokenValidator>,
        bus: Arc<dyn EventBus>,
        metrics: Arc<RelayMetrics>,
        shutdown: Shutdown,
    ) -> Arc<Self> {
        let behaviors = BehaviorSet::for_role(config.role);
        Arc::new(Self {
            config,
            keys,
            directory: Arc::new(ConnectionDirectory::new()),
            registry,
            validator,
            bus,
            pending: Arc::new(PendingResponses::new()),
            metrics,
            shutdown,
            behaviors,
        })
    }

    /// This node's fleet-unique instance id
    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    /// The role this node runs as
    pub fn role(&self) -> NodeRole {
        self.config.role
    }

    /// Version string advertised in `welcome`
    pub fn server_version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Protocol versions agents may assert, in ascending order
    pub fn allowed_protocol_versions(&self) -> Vec<u32> {
        self.config
            .features
            .allowed_protocol_versions
            .iter()
            .copied()
            .collect()
    }
}
