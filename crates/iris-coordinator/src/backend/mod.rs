use async_trait::async_trait;

use crate::NodeId;
use crate::Result;

#[cfg(any(test, feature = "test-fixture"))]
pub mod mock;
pub mod zookeeper;

/// Distributed coordination backend: the single seam every higher-level capability
/// (locks, elections, the set partitioner, ephemeral registration) is built on.
#[async_trait]
pub trait Backend: Send + Sync {
    /// ID of the current node, as known to this backend.
    fn node_id(&self) -> &NodeId;

    /// Create an ephemeral node at `path` carrying `payload`, removed when the session this
    /// backend holds is lost or [`EphemeralRegistration::close`] is called.
    async fn ephemeral_register(
        &self,
        path: &str,
        payload: serde_json::Value,
    ) -> Result<Box<dyn EphemeralHandle>>;

    /// List the payloads of every ephemeral registration currently live under `path`.
    async fn discover(&self, path: &str) -> Result<Vec<serde_json::Value>>;

    /// Acquire a handle to a non-blocking lock at `path`. The handle is not locked yet.
    fn lock(&self, path: &str) -> Box<dyn LockBehaviour>;

    /// Acquire a handle to an election at `path`, contending with `node_id()` as this node's id.
    fn election(&self, path: &str) -> Box<dyn ElectionBehaviour>;

    /// Acquire a handle to a set partitioner at `path` over the given member set.
    fn set_partitioner(&self, path: &str, members: Vec<String>) -> Box<dyn SetPartitionerBehaviour>;
}

/// Handle to an ephemeral registration; call [`close`](EphemeralHandle::close) to deregister
/// early, otherwise the node disappears when the backend's session ends.
#[async_trait]
pub trait EphemeralHandle: Send + Sync {
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Behaviour of a non-blocking distributed lock.
#[async_trait]
pub trait LockBehaviour: Send + Sync {
    async fn acquire(&self) -> Result<()>;
    fn check(&self) -> bool;
    async fn release(&self) -> Result<()>;
}

/// Observable state of an election this node is participating in.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ElectionStatus {
    /// Not currently contending.
    NotCandidate,
    /// Contending, result not known yet.
    InProgress,
    /// This node holds the election.
    Primary,
    /// Another node holds the election; this node is in line.
    Secondary,
    /// The election can no longer make progress (backend/session failure), with a reason.
    Terminated(String),
}

impl ElectionStatus {
    pub fn is_candidate(&self) -> bool {
        !matches!(self, ElectionStatus::NotCandidate)
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, ElectionStatus::Primary)
    }
}

/// Behaviour of a leader election.
#[async_trait]
pub trait ElectionBehaviour: Send + Sync {
    /// Join (or re-join) the election.
    async fn run(&self) -> Result<()>;
    /// Current status, updated by watches as they fire.
    fn status(&self) -> ElectionStatus;
    /// Voluntarily give up primary status, if held.
    async fn step_down(&self) -> Result<()>;
}

/// Observable state of a set partitioner allocation cycle.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PartitionerState {
    /// Waiting on the backend to compute an assignment.
    Allocating,
    /// An assignment is active; `assigned()` reflects this node's current subset.
    Acquired,
    /// The backend asked this node to release its assignment (membership changed).
    Release,
    /// The partitioner failed and must be recreated.
    Failed,
}

/// Behaviour of a coordinator-backed set partitioner (ZooKeeper `SetPartitioner` recipe).
#[async_trait]
pub trait SetPartitionerBehaviour: Send + Sync {
    fn state(&self) -> PartitionerState;
    /// The subset of members assigned to this node. Only meaningful in `Acquired` state.
    fn assigned(&self) -> Vec<String>;
    /// Block until the state transitions away from `Allocating`.
    async fn wait_for_allocation(&self) -> Result<()>;
    /// Acknowledge a `Release` request, handing the assignment back to the recipe.
    async fn acknowledge_release(&self) -> Result<()>;
}
