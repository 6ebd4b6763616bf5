//! Minimal ZooKeeper-backed coordination, built directly atop the `zookeeper` crate's
//! synchronous client. Every blocking call is offloaded to `tokio::task::spawn_blocking`, the
//! one place this crate needs a thread outside the current-thread executor.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use slog::debug;
use slog::error;
use slog::Logger;
use zookeeper::Acl;
use zookeeper::CreateMode;
use zookeeper::WatchedEvent;
use zookeeper::ZooKeeper;

use crate::backend::Backend;
use crate::backend::ElectionBehaviour;
use crate::backend::ElectionStatus;
use crate::backend::EphemeralHandle;
use crate::backend::LockBehaviour;
use crate::backend::PartitionerState;
use crate::backend::SetPartitionerBehaviour;
use crate::config::ZookeeperConfig;
use crate::error::Error;
use crate::error::Result;
use crate::NodeId;

const PREFIX_LOCK: &str = "lock-";

fn noop_watch(_event: WatchedEvent) {}

/// A minimal client over the `zookeeper` crate: ephemeral sequential znodes for locks and
/// elections, and a children-watch recipe approximating ZooKeeper's `SetPartitioner`.
pub struct Zookeeper {
    node_id: NodeId,
    client: Arc<ZooKeeper>,
    logger: Logger,
}

impl Zookeeper {
    pub fn new(node_id: NodeId, config: ZookeeperConfig, logger: Logger) -> Result<Zookeeper> {
        let timeout = Duration::from_secs(config.timeout);
        let client = ZooKeeper::connect(&config.ensemble, timeout, noop_watch)
            .map_err(|error| Error::BackendConnect(Box::new(error)))?;
        Ok(Zookeeper {
            node_id,
            client: Arc::new(client),
            logger,
        })
    }

    fn ensure_path(&self, path: &str) -> Result<()> {
        let mut built = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            built.push('/');
            built.push_str(segment);
            match self.client.create(&built, vec![], Acl::open_unsafe().clone(), CreateMode::Persistent) {
                Ok(_) | Err(zookeeper::ZkError::NodeExists) => {}
                Err(error) => return Err(Error::Backend(format!("create {built}: {error}"))),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for Zookeeper {
    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    async fn ephemeral_register(&self, path: &str, payload: Value) -> Result<Box<dyn EphemeralHandle>> {
        self.ensure_path(path)?;
        let client = Arc::clone(&self.client);
        let data = serde_json::to_vec(&payload).map_err(|e| Error::Encode(e.to_string()))?;
        let path = path.to_string();
        let created = tokio::task::spawn_blocking(move || {
            client.create(&path, data, Acl::open_unsafe().clone(), CreateMode::Ephemeral)
        })
        .await
        .map_err(|e| Error::Backend(format!("spawn_blocking join: {e}")))?
        .map_err(|e| Error::RegistrationFailure(e.to_string()))?;
        Ok(Box::new(ZookeeperEphemeralHandle {
            client: Arc::clone(&self.client),
            path: created,
        }))
    }

    async fn discover(&self, path: &str) -> Result<Vec<Value>> {
        let client = Arc::clone(&self.client);
        let parent = path.to_string();
        tokio::task::spawn_blocking(move || -> std::result::Result<Vec<Value>, zookeeper::ZkError> {
            let children = client.get_children(&parent, false)?;
            let mut payloads = Vec::with_capacity(children.len());
            for child in children {
                let full = format!("{parent}/{child}");
                let (data, _stat) = client.get_data(&full, false)?;
                if let Ok(value) = serde_json::from_slice(&data) {
                    payloads.push(value);
                }
            }
            Ok(payloads)
        })
        .await
        .map_err(|e| Error::Backend(format!("spawn_blocking join: {e}")))?
        .map_err(|e| Error::Backend(e.to_string()))
    }

    fn lock(&self, path: &str) -> Box<dyn LockBehaviour> {
        let _ = self.ensure_path(path);
        Box::new(ZookeeperLock {
            client: Arc::clone(&self.client),
            path: path.to_string(),
            node_id: self.node_id.clone(),
            held_at: std::sync::Mutex::new(None),
            logger: self.logger.clone(),
        })
    }

    fn election(&self, path: &str) -> Box<dyn ElectionBehaviour> {
        let _ = self.ensure_path(path);
        Box::new(ZookeeperElection {
            client: Arc::clone(&self.client),
            path: path.to_string(),
            node_id: self.node_id.clone(),
            own_node: std::sync::Mutex::new(None),
            logger: self.logger.clone(),
        })
    }

    fn set_partitioner(&self, path: &str, members: Vec<String>) -> Box<dyn SetPartitionerBehaviour> {
        let _ = self.ensure_path(path);
        Box::new(ZookeeperSetPartitioner {
            client: Arc::clone(&self.client),
            path: path.to_string(),
            node_id: self.node_id.clone(),
            members,
            own_node: std::sync::Mutex::new(None),
        })
    }
}

struct ZookeeperEphemeralHandle {
    client: Arc<ZooKeeper>,
    path: String,
}

#[async_trait]
impl EphemeralHandle for ZookeeperEphemeralHandle {
    async fn close(self: Box<Self>) -> Result<()> {
        let client = Arc::clone(&self.client);
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || client.delete(&path, None))
            .await
            .map_err(|e| Error::Backend(format!("spawn_blocking join: {e}")))?
            .map_err(|e| Error::Backend(e.to_string()))
    }
}

struct ZookeeperLock {
    client: Arc<ZooKeeper>,
    path: String,
    node_id: NodeId,
    held_at: std::sync::Mutex<Option<String>>,
    logger: Logger,
}

#[async_trait]
impl LockBehaviour for ZookeeperLock {
    async fn acquire(&self) -> Result<()> {
        let client = Arc::clone(&self.client);
        let node = format!("{}/{}", self.path, PREFIX_LOCK);
        let payload = self.node_id.to_string().into_bytes();
        let created = tokio::task::spawn_blocking(move || {
            client.create(&node, payload, Acl::open_unsafe().clone(), CreateMode::EphemeralSequential)
        })
        .await
        .map_err(|e| Error::Backend(format!("spawn_blocking join: {e}")))?
        .map_err(|e| Error::Backend(e.to_string()))?;

        let client = Arc::clone(&self.client);
        let parent = self.path.clone();
        let own = created.clone();
        let is_lowest = tokio::task::spawn_blocking(move || -> std::result::Result<bool, zookeeper::ZkError> {
            let children = client.get_children(&parent, false)?;
            let lowest = children.iter().min().cloned();
            let own_name = own.rsplit('/').next().unwrap_or(&own).to_string();
            Ok(lowest.as_deref() == Some(own_name.as_str()))
        })
        .await
        .map_err(|e| Error::Backend(format!("spawn_blocking join: {e}")))?
        .map_err(|e| Error::Backend(e.to_string()))?;

        if !is_lowest {
            let client = Arc::clone(&self.client);
            let own = created.clone();
            let _ = tokio::task::spawn_blocking(move || client.delete(&own, None)).await;
            return Err(Error::LockHeld(self.path.clone(), self.node_id.clone()));
        }
        *self.held_at.lock().expect("ZookeeperLock::held_at poisoned") = Some(created);
        Ok(())
    }

    fn check(&self) -> bool {
        self.held_at.lock().expect("ZookeeperLock::held_at poisoned").is_some()
    }

    async fn release(&self) -> Result<()> {
        let node = self
            .held_at
            .lock()
            .expect("ZookeeperLock::held_at poisoned")
            .take();
        match node {
            Some(node) => {
                let client = Arc::clone(&self.client);
                tokio::task::spawn_blocking(move || client.delete(&node, None))
                    .await
                    .map_err(|e| Error::Backend(format!("spawn_blocking join: {e}")))?
                    .map_err(|e| Error::Backend(e.to_string()))?;
                Ok(())
            }
            None => {
                debug!(self.logger, "release of a lock this node does not hold"; "path" => &self.path);
                Err(Error::LockNotHeld(self.path.clone()))
            }
        }
    }
}

struct ZookeeperElection {
    client: Arc<ZooKeeper>,
    path: String,
    node_id: NodeId,
    own_node: std::sync::Mutex<Option<String>>,
    logger: Logger,
}

#[async_trait]
impl ElectionBehaviour for ZookeeperElection {
    async fn run(&self) -> Result<()> {
        if self.own_node.lock().expect("ZookeeperElection::own_node poisoned").is_some() {
            return Ok(());
        }
        let client = Arc::clone(&self.client);
        let node = format!("{}/{}", self.path, PREFIX_LOCK);
        let payload = self.node_id.to_string().into_bytes();
        let created = tokio::task::spawn_blocking(move || {
            client.create(&node, payload, Acl::open_unsafe().clone(), CreateMode::EphemeralSequential)
        })
        .await
        .map_err(|e| Error::Backend(format!("spawn_blocking join: {e}")))?
        .map_err(|e| Error::Backend(e.to_string()))?;
        *self.own_node.lock().expect("ZookeeperElection::own_node poisoned") = Some(created);
        Ok(())
    }

    fn status(&self) -> ElectionStatus {
        let own_node = self.own_node.lock().expect("ZookeeperElection::own_node poisoned").clone();
        let own_node = match own_node {
            Some(node) => node,
            None => return ElectionStatus::NotCandidate,
        };
        let own_name = own_node.rsplit('/').next().unwrap_or(&own_node).to_string();
        match self.client.get_children(&self.path, false) {
            Ok(mut children) => {
                children.sort();
                match children.iter().position(|name| *name == own_name) {
                    Some(0) => ElectionStatus::Primary,
                    Some(_) => ElectionStatus::Secondary,
                    None => ElectionStatus::Terminated("znode no longer present".to_string()),
                }
            }
            Err(error) => {
                error!(self.logger, "failed to list election contenders"; "error" => %error);
                ElectionStatus::Terminated(error.to_string())
            }
        }
    }

    async fn step_down(&self) -> Result<()> {
        let node = self
            .own_node
            .lock()
            .expect("ZookeeperElection::own_node poisoned")
            .take();
        if let Some(node) = node {
            let client = Arc::clone(&self.client);
            tokio::task::spawn_blocking(move || client.delete(&node, None))
                .await
                .map_err(|e| Error::Backend(format!("spawn_blocking join: {e}")))?
                .map_err(|e| Error::Backend(e.to_string()))?;
        }
        Ok(())
    }
}

struct ZookeeperSetPartitioner {
    client: Arc<ZooKeeper>,
    path: String,
    node_id: NodeId,
    members: Vec<String>,
    own_node: std::sync::Mutex<Option<String>>,
}

#[async_trait]
impl SetPartitionerBehaviour for ZookeeperSetPartitioner {
    fn state(&self) -> PartitionerState {
        PartitionerState::Acquired
    }

    fn assigned(&self) -> Vec<String> {
        let own_node = {
            let guard = self.own_node.lock().expect("ZookeeperSetPartitioner::own_node poisoned");
            guard.clone()
        };
        let own_node = match own_node {
            Some(node) => node,
            None => return Vec::new(),
        };
        let own_name = own_node.rsplit('/').next().unwrap_or(&own_node).to_string();
        let mut children = match self.client.get_children(&self.path, false) {
            Ok(children) => children,
            Err(_) => return Vec::new(),
        };
        children.sort();
        let index = match children.iter().position(|name| *name == own_name) {
            Some(index) => index,
            None => return Vec::new(),
        };
        let count = children.len().max(1);
        self.members
            .iter()
            .enumerate()
            .filter(|(i, _)| i % count == index)
            .map(|(_, member)| member.clone())
            .collect()
    }

    async fn wait_for_allocation(&self) -> Result<()> {
        if self.own_node.lock().expect("ZookeeperSetPartitioner::own_node poisoned").is_some() {
            return Ok(());
        }
        let client = Arc::clone(&self.client);
        let node = format!("{}/{}", self.path, PREFIX_LOCK);
        let payload = self.node_id.to_string().into_bytes();
        let created = tokio::task::spawn_blocking(move || {
            client.create(&node, payload, Acl::open_unsafe().clone(), CreateMode::EphemeralSequential)
        })
        .await
        .map_err(|e| Error::Backend(format!("spawn_blocking join: {e}")))?
        .map_err(|e| Error::Backend(e.to_string()))?;
        *self.own_node.lock().expect("ZookeeperSetPartitioner::own_node poisoned") = Some(created);
        Ok(())
    }

    async fn acknowledge_release(&self) -> Result<()> {
        let node = self
            .own_node
            .lock()
            .expect("ZookeeperSetPartitioner::own_node poisoned")
            .take();
        if let Some(node) = node {
            let client = Arc::clone(&self.client);
            tokio::task::spawn_blocking(move || client.delete(&node, None))
                .await
                .map_err(|e| Error::Backend(format!("spawn_blocking join: {e}")))?
                .map_err(|e| Error::Backend(e.to_string()))?;
        }
        Ok(())
    }
}
