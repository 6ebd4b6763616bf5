//! Distributed coordination capability shared by the service registry, event system, and the
//! leader/partitioning patterns: locks, elections, ephemeral registration, and a set
//! partitioner, backed by either ZooKeeper or a deterministic in-process mock.
pub mod backend;
mod config;
mod coordinator;
mod error;
mod metrics;
mod node_id;

pub use crate::backend::ElectionStatus;
pub use crate::backend::PartitionerState;
pub use crate::config::BackendConfig;
pub use crate::config::Config;
pub use crate::config::ZookeeperConfig;
pub use crate::coordinator::Coordinator;
pub use crate::coordinator::Election;
pub use crate::coordinator::EphemeralRegistration;
pub use crate::coordinator::LoopingElection;
pub use crate::coordinator::LoopingElectionControl;
pub use crate::coordinator::LoopingElectionLogic;
pub use crate::coordinator::LoopingElectionOpts;
pub use crate::coordinator::NonBlockingLock;
pub use crate::coordinator::SetPartitioner;
pub use crate::error::Error;
pub use crate::error::Result;
pub use crate::metrics::register_metrics;
pub use crate::node_id::NodeId;

#[cfg(any(test, feature = "test-fixture"))]
pub use crate::backend::mock::MockBackend;
#[cfg(any(test, feature = "test-fixture"))]
pub use crate::backend::mock::MockRegistry;
