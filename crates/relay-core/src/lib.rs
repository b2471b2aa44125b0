//! Strand Relay Core
//!
//! The in-process relay engine of one node: the connection state machine
//! for each stream, per-connection and cross-node routing, the
//! pending-response correlator, the tenant registry adapter, and the
//! directory of locally-attached connections. Transport ingress and
//! process bootstrap live in the server crate; this crate is the part that
//! decides what every frame means and where it goes.

pub mod behaviors;
pub mod context;
pub mod directory;
pub mod error;
pub mod hooks;
pub mod intake;
pub mod interest;
pub mod keeper;
pub mod metrics;
pub mod pending;
pub mod ports;
pub mod receive;
pub mod registry;
pub mod shutdown;
pub mod socket;
pub mod state;
pub mod testutil;
pub mod transport;

pub use behaviors::BehaviorSet;
pub use context::RelayContext;
pub use directory::ConnectionDirectory;
pub use error::{RelayError, Result};
pub use hooks::after_disconnect;
pub use intake::run_intake;
pub use interest::RecentInterestMap;
pub use keeper::run_keeper;
pub use metrics::RelayMetrics;
pub use pending::{PendingKey, PendingOutcome, PendingResponses};
pub use ports::{
    AgentActivityMessage, AgentActivityType, AgentControlCommandRequest,
    AgentControlCommandResponse, BusControlRequest, EventBus, NullEventBus,
    PublicKeyAnnouncement, TokenValidation, TokenValidator,
};
pub use receive::{run_connection, StreamOrigin};
pub use registry::{InMemoryRegistry, Registration, RegistryStore};
pub use shutdown::{Shutdown, ShutdownListener};
pub use socket::{Seal, SocketState};
pub use state::ConnectionState;
pub use transport::{CloseCode, FrameSink, FrameSource, InboundFrame};
