use std::sync::Arc;

use serde_json::Value;
use slog::Logger;

use crate::backend;
use crate::backend::Backend;
use crate::config::BackendConfig;
use crate::config::Config;
use crate::error::Error;
use crate::error::Result;
use crate::NodeId;

mod election;
mod lock;
mod looping_election;
mod partitioner;

pub use self::election::Election;
pub use self::lock::NonBlockingLock;
pub use self::looping_election::LoopingElection;
pub use self::looping_election::LoopingElectionControl;
pub use self::looping_election::LoopingElectionLogic;
pub use self::looping_election::LoopingElectionOpts;
pub use self::partitioner::SetPartitioner;

/// Interface to access distributed coordination services.
///
/// Cloning a `Coordinator` is cheap: it shares the backend connection.
#[derive(Clone)]
pub struct Coordinator(Arc<dyn Backend>);

impl Coordinator {
    pub fn new(config: Config, logger: Logger) -> Result<Coordinator> {
        let node_id = NodeId::new().with_extra(config.node_attributes);
        let backend: Arc<dyn Backend> = match config.backend {
            BackendConfig::Mock => Arc::new(backend::mock::MockBackend::new(node_id)),
            BackendConfig::Zookeeper(zk_config) => {
                Arc::new(backend::zookeeper::Zookeeper::new(node_id, zk_config, logger)?)
            }
        };
        Ok(Coordinator(backend))
    }

    /// Build a `Coordinator` directly from a backend, bypassing config-driven construction.
    /// Used by tests and by demo binaries wiring up a [`backend::mock::MockBackend`].
    pub fn with_backend(backend: Arc<dyn Backend>) -> Coordinator {
        Coordinator(backend)
    }

    pub fn node_id(&self) -> &NodeId {
        self.0.node_id()
    }

    /// Register an ephemeral node at `path`, removed automatically if this node's session ends.
    pub async fn ephemeral_register(&self, path: &str, payload: Value) -> Result<EphemeralRegistration> {
        let handle = self.0.ephemeral_register(path, payload).await?;
        Ok(EphemeralRegistration { handle: Some(handle) })
    }

    /// List the payloads of every live ephemeral registration under `path`.
    pub async fn discover(&self, path: &str) -> Result<Vec<Value>> {
        self.0.discover(path).await
    }

    /// A non-blocking lock at `path`. Acquiring it is a separate, explicit step.
    pub fn non_blocking_lock(&self, path: impl Into<String>) -> NonBlockingLock {
        let path = path.into();
        NonBlockingLock::new(self.0.lock(&path))
    }

    /// An election at `path`, contending under this coordinator's `node_id()`.
    pub fn election(&self, path: impl Into<String>) -> Election {
        let path = path.into();
        Election::new(self.0.election(&path))
    }

    /// A set partitioner at `path` over the given set of member keys.
    pub fn set_partitioner(&self, path: impl Into<String>, members: Vec<String>) -> SetPartitioner {
        let path = path.into();
        SetPartitioner::new(self.0.set_partitioner(&path, members))
    }
}

/// Owning handle to an ephemeral registration.
pub struct EphemeralRegistration {
    handle: Option<Box<dyn backend::EphemeralHandle>>,
}

impl EphemeralRegistration {
    /// Deregister early instead of waiting for session loss.
    pub async fn close(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => handle.close().await,
            None => Err(Error::Backend("ephemeral registration already closed".into())),
        }
    }
}
