//! Multi-tenant randomness beacon node.
//!
//! A [`Daemon`] hosts one [`BeaconProcess`] per beacon id. Each process:
//!
//! - Runs DKG and resharing sessions (`session`) as leader or follower
//! - Produces one entry per round once keyed (`generation`), exchanging
//!   partial signatures with its group
//! - Catches up from peers when behind (`sync`)
//!
//! Requests are routed to processes by beacon id or chain hash (`router`).
//! Networking sits behind the [`PeerClient`] and [`PeerService`] traits so
//! the same engine runs over RPC or in-process.
//!
//! # Example
//!
//! ```ignore
//! use beacon_node::{Daemon, LocalNetwork, MemKeyStore, NodeConfig, PeerService};
//!
//! let network = LocalNetwork::new();
//! let daemon = Daemon::new(NodeConfig::new("node-0"), MemKeyStore::new(), network.client("node-0"));
//! let service: std::sync::Arc<dyn PeerService> = daemon.clone();
//! network.register("node-0", &service);
//! ```

pub mod clock;
pub mod config;
pub mod daemon;
pub mod error;
pub mod generation;
pub mod key_store;
pub mod messages;
pub mod process;
pub mod router;
pub mod session;
pub mod sync;
pub mod transport;

#[cfg(test)]
mod testing;

pub use clock::Clock;
pub use config::NodeConfig;
pub use daemon::Daemon;
pub use error::{BeaconError, BeaconResult};
pub use key_store::{FileKeyStore, KeyPair, KeyStore, KeyStoreError, MemKeyStore};
pub use messages::{
    BeaconStatus, ChainInfoResponse, DkgInvitation, DkgPacketMessage, Identity, InitDkgFollowerRequest,
    InitDkgLeaderRequest, InitReshareLeaderRequest, StatusResponse, SyncRequest,
};
pub use process::BeaconProcess;
pub use router::BeaconRegistry;
pub use session::{Role, SessionOutcome};
pub use transport::{LocalNetwork, PeerClient, PeerService, TransportError, TransportResult};
