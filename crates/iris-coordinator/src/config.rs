use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// Distributed coordinator configuration options.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// User specified key/value map attached to this node's ID, for debugging.
    #[serde(default)]
    pub node_attributes: BTreeMap<String, String>,

    /// Which backend to use and its settings.
    #[serde(default)]
    pub backend: BackendConfig,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            node_attributes: BTreeMap::new(),
            backend: BackendConfig::default(),
        }
    }
}

/// Selects and configures the coordination backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum BackendConfig {
    /// A deterministic in-process backend; only valid for tests and local demos.
    Mock,
    /// The ZooKeeper-backed production backend.
    Zookeeper(ZookeeperConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Mock
    }
}

/// ZooKeeper distributed coordination configuration options.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ZookeeperConfig {
    /// ZooKeeper ensemble connection string (`host:port[,host:port...][/chroot]`).
    #[serde(default = "ZookeeperConfig::default_ensemble")]
    pub ensemble: String,

    /// Session timeout, in seconds.
    #[serde(default = "ZookeeperConfig::default_timeout")]
    pub timeout: u64,
}

impl Default for ZookeeperConfig {
    fn default() -> ZookeeperConfig {
        ZookeeperConfig {
            ensemble: ZookeeperConfig::default_ensemble(),
            timeout: ZookeeperConfig::default_timeout(),
        }
    }
}

impl ZookeeperConfig {
    fn default_ensemble() -> String {
        "localhost:2181/iris".into()
    }

    fn default_timeout() -> u64 {
        10
    }
}
