#![warn(missing_docs)]

//! PlanetMesh node core: planet routing, realtime presence directory,
//! admission control and node statistics

pub mod admission;
pub mod config;
pub mod directory;
pub mod error;
pub mod health;
pub mod identity;
pub mod locator;
pub mod node;
pub mod placement;
pub mod stats;
pub mod types;

pub use admission::{AdmissionConfig, AdmissionGate, Policy, QuotaStore, StaticQuotaStore};
pub use config::NodeConfig;
pub use directory::{DirectoryConfig, DirectorySnapshot, GroupMembers, PresenceDirectory};
pub use error::{MeshError, Result};
pub use health::{HealthMonitor, HealthStatus};
pub use identity::{Credential, IdentityCell, NodeIdentity};
pub use locator::{HostingNode, PlacementTable, Redirect, ShardLocator};
pub use node::MeshNode;
pub use stats::{DetailedNodeStats, NodeStats, StatsAggregator, StatsSink};
pub use types::{ConnectionId, Group, NodeName, PlanetId, UserId};
