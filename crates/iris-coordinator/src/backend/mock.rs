use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use serde_json::Value;

use crate::backend::Backend;
use crate::backend::ElectionBehaviour;
use crate::backend::ElectionStatus;
use crate::backend::EphemeralHandle;
use crate::backend::LockBehaviour;
use crate::backend::PartitionerState;
use crate::backend::SetPartitionerBehaviour;
use crate::error::Error;
use crate::error::Result;
use crate::NodeId;

/// Deterministic in-process coordination state, shared by every [`MockBackend`] built with
/// [`MockBackend::with_registry`] against the same [`MockRegistry`] — the mock's analogue of a
/// ZooKeeper ensemble shared by a fleet of nodes under test.
#[derive(Default)]
pub struct MockRegistry {
    ephemeral: Mutex<HashMap<String, Value>>,
    locks: Mutex<HashMap<String, Arc<LockState>>>,
    elections: Mutex<HashMap<String, Arc<ElectionState>>>,
    partitioners: Mutex<HashMap<String, Arc<PartitionerSharedState>>>,
}

impl MockRegistry {
    pub fn new() -> Arc<MockRegistry> {
        Arc::new(MockRegistry::default())
    }

    fn lock_state(&self, path: &str) -> Arc<LockState> {
        self.locks
            .lock()
            .expect("MockRegistry::locks poisoned")
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(LockState::default()))
            .clone()
    }

    fn election_state(&self, path: &str) -> Arc<ElectionState> {
        self.elections
            .lock()
            .expect("MockRegistry::elections poisoned")
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(ElectionState::default()))
            .clone()
    }

    fn partitioner_state(&self, path: &str, members: &[String]) -> Arc<PartitionerSharedState> {
        let mut guard = self.partitioners.lock().expect("MockRegistry::partitioners poisoned");
        guard
            .entry(path.to_string())
            .or_insert_with(|| {
                Arc::new(PartitionerSharedState {
                    members: members.to_vec(),
                    participants: Mutex::new(Vec::new()),
                })
            })
            .clone()
    }
}

#[derive(Default)]
struct LockState {
    holder: Mutex<Option<NodeId>>,
}

#[derive(Default)]
struct ElectionState {
    next_seq: AtomicU64,
    contenders: Mutex<Vec<(u64, NodeId)>>,
}

struct PartitionerSharedState {
    members: Vec<String>,
    participants: Mutex<Vec<NodeId>>,
}

/// A deterministic in-process [`Backend`], usable standalone (every lock/election trivially
/// succeeds, single contender) or shared across several `MockBackend`s built from the same
/// [`MockRegistry`] to simulate a small fleet contending for the same resources.
pub struct MockBackend {
    node_id: NodeId,
    registry: Arc<MockRegistry>,
}

impl MockBackend {
    /// A standalone backend with a private registry: this node is always the sole contender.
    pub fn new(node_id: NodeId) -> MockBackend {
        MockBackend {
            node_id,
            registry: MockRegistry::new(),
        }
    }

    /// A backend sharing coordination state with every other `MockBackend` built from the same
    /// `registry`, to simulate multiple nodes contending for the same locks/elections.
    pub fn with_registry(node_id: NodeId, registry: Arc<MockRegistry>) -> MockBackend {
        MockBackend { node_id, registry }
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    async fn ephemeral_register(&self, path: &str, payload: Value) -> Result<Box<dyn EphemeralHandle>> {
        self.registry
            .ephemeral
            .lock()
            .expect("MockRegistry::ephemeral poisoned")
            .insert(path.to_string(), payload);
        Ok(Box::new(MockEphemeralHandle {
            registry: Arc::clone(&self.registry),
            path: path.to_string(),
        }))
    }

    async fn discover(&self, path: &str) -> Result<Vec<Value>> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let ephemeral = self.registry.ephemeral.lock().expect("MockRegistry::ephemeral poisoned");
        Ok(ephemeral
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, value)| value.clone())
            .collect())
    }

    fn lock(&self, path: &str) -> Box<dyn LockBehaviour> {
        Box::new(MockLock {
            path: path.to_string(),
            node_id: self.node_id.clone(),
            state: self.registry.lock_state(path),
        })
    }

    fn election(&self, path: &str) -> Box<dyn ElectionBehaviour> {
        Box::new(MockElection {
            node_id: self.node_id.clone(),
            state: self.registry.election_state(path),
        })
    }

    fn set_partitioner(&self, path: &str, members: Vec<String>) -> Box<dyn SetPartitionerBehaviour> {
        let state = self.registry.partitioner_state(path, &members);
        state
            .participants
            .lock()
            .expect("MockRegistry::partitioner participants poisoned")
            .push(self.node_id.clone());
        Box::new(MockSetPartitioner {
            node_id: self.node_id.clone(),
            state,
        })
    }
}

struct MockEphemeralHandle {
    registry: Arc<MockRegistry>,
    path: String,
}

#[async_trait]
impl EphemeralHandle for MockEphemeralHandle {
    async fn close(self: Box<Self>) -> Result<()> {
        self.registry
            .ephemeral
            .lock()
            .expect("MockRegistry::ephemeral poisoned")
            .remove(&self.path);
        Ok(())
    }
}

struct MockLock {
    path: String,
    node_id: NodeId,
    state: Arc<LockState>,
}

#[async_trait]
impl LockBehaviour for MockLock {
    async fn acquire(&self) -> Result<()> {
        crate::metrics::LOCK_ACQUIRE_TOTAL.inc();
        let mut holder = self.state.holder.lock().expect("MockLock::holder poisoned");
        match holder.as_ref() {
            Some(existing) => {
                crate::metrics::LOCK_ACQUIRE_FAIL.inc();
                Err(Error::LockHeld(self.path.clone(), existing.clone()))
            }
            None => {
                *holder = Some(self.node_id.clone());
                Ok(())
            }
        }
    }

    fn check(&self) -> bool {
        self.state.holder.lock().expect("MockLock::holder poisoned").is_some()
    }

    async fn release(&self) -> Result<()> {
        let mut holder = self.state.holder.lock().expect("MockLock::holder poisoned");
        match holder.as_ref() {
            Some(existing) if *existing == self.node_id => {
                *holder = None;
                Ok(())
            }
            _ => Err(Error::LockNotHeld(self.path.clone())),
        }
    }
}

struct MockElection {
    node_id: NodeId,
    state: Arc<ElectionState>,
}

#[async_trait]
impl ElectionBehaviour for MockElection {
    async fn run(&self) -> Result<()> {
        let mut contenders = self.state.contenders.lock().expect("MockElection::contenders poisoned");
        if !contenders.iter().any(|(_, id)| *id == self.node_id) {
            let seq = self.state.next_seq.fetch_add(1, Ordering::SeqCst);
            contenders.push((seq, self.node_id.clone()));
            contenders.sort_by_key(|(seq, _)| *seq);
        }
        Ok(())
    }

    fn status(&self) -> ElectionStatus {
        let contenders = self.state.contenders.lock().expect("MockElection::contenders poisoned");
        match contenders.iter().position(|(_, id)| *id == self.node_id) {
            None => ElectionStatus::NotCandidate,
            Some(0) => ElectionStatus::Primary,
            Some(_) => ElectionStatus::Secondary,
        }
    }

    async fn step_down(&self) -> Result<()> {
        let mut contenders = self.state.contenders.lock().expect("MockElection::contenders poisoned");
        contenders.retain(|(_, id)| *id != self.node_id);
        Ok(())
    }
}

struct MockSetPartitioner {
    node_id: NodeId,
    state: Arc<PartitionerSharedState>,
}

#[async_trait]
impl SetPartitionerBehaviour for MockSetPartitioner {
    fn state(&self) -> PartitionerState {
        PartitionerState::Acquired
    }

    fn assigned(&self) -> Vec<String> {
        let participants = self
            .state
            .participants
            .lock()
            .expect("MockRegistry::partitioner participants poisoned");
        let index = match participants.iter().position(|id| *id == self.node_id) {
            Some(index) => index,
            None => return Vec::new(),
        };
        let count = participants.len().max(1);
        self.state
            .members
            .iter()
            .enumerate()
            .filter(|(i, _)| i % count == index)
            .map(|(_, member)| member.clone())
            .collect()
    }

    async fn wait_for_allocation(&self) -> Result<()> {
        Ok(())
    }

    async fn acknowledge_release(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn standalone_backend_is_trivially_primary() {
        let backend = MockBackend::new(NodeId::new());
        let election = backend.election("/elections/test");
        election.run().await.expect("run");
        assert_eq!(election.status(), ElectionStatus::Primary);
    }

    #[tokio::test]
    async fn shared_registry_orders_contenders_by_arrival() {
        let registry = MockRegistry::new();
        let first = MockBackend::with_registry(NodeId::new(), Arc::clone(&registry));
        let second = MockBackend::with_registry(NodeId::new(), Arc::clone(&registry));
        let first_election = first.election("/elections/shared");
        let second_election = second.election("/elections/shared");
        first_election.run().await.expect("run");
        second_election.run().await.expect("run");
        assert_eq!(first_election.status(), ElectionStatus::Primary);
        assert_eq!(second_election.status(), ElectionStatus::Secondary);

        first_election.step_down().await.expect("step down");
        assert_eq!(first_election.status(), ElectionStatus::NotCandidate);
        assert_eq!(second_election.status(), ElectionStatus::Secondary);
        second_election.run().await.expect("run again");
        assert_eq!(second_election.status(), ElectionStatus::Primary);
    }

    #[tokio::test]
    async fn partitioner_splits_members_round_robin() {
        let registry = MockRegistry::new();
        let members: Vec<String> = (0..4).map(|i| format!("queue.{i}")).collect();
        let first = MockBackend::with_registry(NodeId::new(), Arc::clone(&registry));
        let second = MockBackend::with_registry(NodeId::new(), Arc::clone(&registry));
        let first_partitioner = first.set_partitioner("/iris/serializer", members.clone());
        let second_partitioner = second.set_partitioner("/iris/serializer", members.clone());
        let mut all: Vec<String> = first_partitioner.assigned();
        all.extend(second_partitioner.assigned());
        all.sort();
        assert_eq!(all, members);
    }
}
