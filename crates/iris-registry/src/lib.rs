//! Service discovery and registration, consumed by the service container to advertise its own
//! installed services and to resolve `iris://<service_type>` addresses for peers.
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use async_trait::async_trait;
use iris_coordinator::Coordinator;
use iris_coordinator::EphemeralRegistration;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("coordinator error: {0}")]
    Coordinator(#[from] iris_coordinator::Error),

    #[error("no known instance of service '{0}'")]
    Unknown(String),

    #[error("failed to register service '{0}': {1}")]
    RegistrationFailure(String, String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A resolved set of endpoints serving a `service_type`, with a simple round-robin address
/// picker. Load-balancing policy beyond round-robin is the registry implementation's to define.
pub struct ServiceInstance {
    pub service_type: String,
    endpoints: Vec<String>,
    cursor: AtomicUsize,
}

impl ServiceInstance {
    pub fn new(service_type: impl Into<String>, endpoints: Vec<String>) -> Self {
        ServiceInstance {
            service_type: service_type.into(),
            endpoints,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// The next endpoint to send to, rotating through known endpoints.
    pub fn next_address(&self) -> Option<&str> {
        if self.endpoints.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        Some(&self.endpoints[index])
    }
}

#[derive(Serialize, Deserialize)]
struct RegistrationPayload {
    endpoint: String,
}

/// Contract the container relies on to advertise and resolve peers.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn on_start(&self) -> Result<()>;
    async fn on_stop(&self) -> Result<()>;
    /// Advertise `endpoint` as serving `service_type`.
    async fn register(&self, service_type: &str, endpoint: &str) -> Result<()>;
    /// Resolve a `service_type` to its currently known instances.
    async fn get(&self, service_type: &str) -> Result<ServiceInstance>;
    /// List every service type with at least one live registration.
    async fn discover(&self) -> Result<Vec<String>>;
}

const REGISTRY_ROOT: &str = "/iris/registry";

/// Coordinator-backed registry: registrations are ephemeral znodes under
/// `/iris/registry/<service_type>/<node_id>`, so a crashed node's advertisement disappears with
/// its coordinator session.
pub struct CoordinatorRegistry {
    coordinator: Coordinator,
    known_types: Mutex<Vec<String>>,
    registrations: Mutex<Vec<EphemeralRegistration>>,
}

impl CoordinatorRegistry {
    pub fn new(coordinator: Coordinator) -> Self {
        CoordinatorRegistry {
            coordinator,
            known_types: Mutex::new(Vec::new()),
            registrations: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ServiceRegistry for CoordinatorRegistry {
    async fn on_start(&self) -> Result<()> {
        Ok(())
    }

    async fn on_stop(&self) -> Result<()> {
        let handles: Vec<_> = self.registrations.lock().expect("registrations poisoned").drain(..).collect();
        for handle in handles {
            handle.close().await?;
        }
        Ok(())
    }

    async fn register(&self, service_type: &str, endpoint: &str) -> Result<()> {
        let node_id = self.coordinator.node_id().to_string();
        let path = format!("{REGISTRY_ROOT}/{service_type}/{node_id}");
        let payload = serde_json::to_value(RegistrationPayload {
            endpoint: endpoint.to_string(),
        })
        .map_err(|e| Error::RegistrationFailure(service_type.to_string(), e.to_string()))?;
        let handle = self
            .coordinator
            .ephemeral_register(&path, payload)
            .await
            .map_err(|e| Error::RegistrationFailure(service_type.to_string(), e.to_string()))?;
        self.registrations.lock().expect("registrations poisoned").push(handle);
        self.known_types.lock().expect("known_types poisoned").push(service_type.to_string());
        Ok(())
    }

    async fn get(&self, service_type: &str) -> Result<ServiceInstance> {
        let path = format!("{REGISTRY_ROOT}/{service_type}");
        let payloads = self.coordinator.discover(&path).await?;
        let endpoints: Vec<String> = payloads
            .into_iter()
            .filter_map(|value| serde_json::from_value::<RegistrationPayload>(value).ok())
            .map(|payload| payload.endpoint)
            .collect();
        if endpoints.is_empty() {
            return Err(Error::Unknown(service_type.to_string()));
        }
        Ok(ServiceInstance::new(service_type, endpoints))
    }

    async fn discover(&self) -> Result<Vec<String>> {
        Ok(self.known_types.lock().expect("known_types poisoned").clone())
    }
}

/// In-memory registry for tests and local demos: no coordinator round trip.
#[cfg(any(test, feature = "test-fixture"))]
pub mod fixture {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::Error;
    use super::Result;
    use super::ServiceInstance;
    use super::ServiceRegistry;

    #[derive(Default)]
    pub struct FixtureRegistry {
        services: Mutex<HashMap<String, Vec<String>>>,
    }

    impl FixtureRegistry {
        pub fn new() -> Self {
            FixtureRegistry::default()
        }
    }

    #[async_trait]
    impl ServiceRegistry for FixtureRegistry {
        async fn on_start(&self) -> Result<()> {
            Ok(())
        }

        async fn on_stop(&self) -> Result<()> {
            Ok(())
        }

        async fn register(&self, service_type: &str, endpoint: &str) -> Result<()> {
            self.services
                .lock()
                .expect("services poisoned")
                .entry(service_type.to_string())
                .or_default()
                .push(endpoint.to_string());
            Ok(())
        }

        async fn get(&self, service_type: &str) -> Result<ServiceInstance> {
            let services = self.services.lock().expect("services poisoned");
            match services.get(service_type) {
                Some(endpoints) if !endpoints.is_empty() => {
                    Ok(ServiceInstance::new(service_type, endpoints.clone()))
                }
                _ => Err(Error::Unknown(service_type.to_string())),
            }
        }

        async fn discover(&self) -> Result<Vec<String>> {
            Ok(self.services.lock().expect("services poisoned").keys().cloned().collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixture::FixtureRegistry;
    use super::*;

    #[tokio::test]
    async fn fixture_round_trips_registration() {
        let registry = FixtureRegistry::new();
        registry.register("echo", "tcp://127.0.0.1:9000").await.expect("register");
        let instance = registry.get("echo").await.expect("get");
        assert_eq!(instance.next_address(), Some("tcp://127.0.0.1:9000"));
    }

    #[tokio::test]
    async fn fixture_unknown_service_is_an_error() {
        let registry = FixtureRegistry::new();
        assert!(matches!(registry.get("missing").await, Err(Error::Unknown(_))));
    }

    #[tokio::test]
    async fn instance_round_robins_across_endpoints() {
        let instance = ServiceInstance::new("echo", vec!["a".to_string(), "b".to_string()]);
        assert_eq!(instance.next_address(), Some("a"));
        assert_eq!(instance.next_address(), Some("b"));
        assert_eq!(instance.next_address(), Some("a"));
    }

    #[tokio::test]
    async fn coordinator_backed_registry_resolves_own_registration() {
        let node_id = iris_coordinator::NodeId::new();
        let backend = iris_coordinator::MockBackend::new(node_id);
        let coordinator = Coordinator::with_backend(std::sync::Arc::new(backend));
        let registry = CoordinatorRegistry::new(coordinator);
        registry.register("echo", "tcp://127.0.0.1:9001").await.expect("register");
        let instance = registry.get("echo").await.expect("get");
        assert_eq!(instance.next_address(), Some("tcp://127.0.0.1:9001"));
    }
}
