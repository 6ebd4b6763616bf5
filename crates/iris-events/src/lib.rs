//! Publish/subscribe event system consumed by the service container.
//!
//! Two backends are provided: [`DirectEvents`], an in-process fan-out usable standalone, and
//! [`CoordinatorEvents`], which layers coordinator-tracked subscriber membership and an
//! injected [`EventTransport`] on top of the same local fan-out for multi-node delivery.
//! Ordering across unrelated event types is not guaranteed; ordering within a single type is
//! backend-dependent (both backends here preserve per-type emission order to already-subscribed
//! receivers).
use std::sync::Mutex;

use async_trait::async_trait;
use iris_coordinator::Coordinator;
use iris_coordinator::EphemeralRegistration;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum Error {
    #[error("coordinator error: {0}")]
    Coordinator(#[from] iris_coordinator::Error),

    #[error("failed to decode event payload: {0}")]
    Decode(String),

    #[error("event bus closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Prefix used by [`CoordinatorEvents`] when relaying an event as an `iris-message::Message`
/// subject, so a container's receive loop can recognise and route one without a dedicated
/// message kind.
pub const EVENT_SUBJECT_PREFIX: &str = "iris.event.";

pub fn event_subject(event_type: &str) -> String {
    format!("{EVENT_SUBJECT_PREFIX}{event_type}")
}

/// True if `subject` is an event relay, per [`EVENT_SUBJECT_PREFIX`].
pub fn is_event_subject(subject: &str) -> bool {
    subject.starts_with(EVENT_SUBJECT_PREFIX)
}

pub fn event_type_from_subject(subject: &str) -> Option<&str> {
    subject.strip_prefix(EVENT_SUBJECT_PREFIX)
}

/// An event published by a container, tagged with the identity of its emitter.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub event_type: String,
    pub source: String,
    pub payload: Value,
}

impl Event {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, payload: Value) -> Self {
        Event {
            event_type: event_type.into(),
            source: source.into(),
            payload,
        }
    }
}

/// A subscription pattern matched against [`Event::event_type`].
///
/// A pattern ending in `*` matches every event type sharing that prefix; any other pattern is
/// an exact match.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Pattern(String);

impl Pattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Pattern(pattern.into())
    }

    pub fn matches(&self, event_type: &str) -> bool {
        match self.0.strip_suffix('*') {
            Some(prefix) => event_type.starts_with(prefix),
            None => self.0 == event_type,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Pattern {
    fn from(value: &str) -> Self {
        Pattern::new(value)
    }
}

impl From<String> for Pattern {
    fn from(value: String) -> Self {
        Pattern::new(value)
    }
}

/// Contract the container relies on to publish and subscribe to events.
#[async_trait]
pub trait EventSystem: Send + Sync {
    async fn on_start(&self) -> Result<()>;
    async fn on_stop(&self) -> Result<()>;
    /// Publish `event`. Delivery is best-effort, at-least-once.
    async fn emit(&self, event: Event) -> Result<()>;
    /// Subscribe to events matching `pattern`, returning a handle to pull them from.
    fn subscribe(&self, pattern: Pattern) -> Subscription;

    /// Publish the current set of `subscribe`d patterns to whatever out-of-band membership
    /// tracking this backend uses. A no-op for backends (like [`DirectEvents`]) with no
    /// fleet-wide membership to publish; [`CoordinatorEvents`] overrides this to call
    /// [`CoordinatorEvents::resubscribe`].
    async fn sync_subscriptions(&self) -> Result<()> {
        Ok(())
    }
}

/// A live subscription; drop it to unsubscribe.
pub struct Subscription {
    pattern: Pattern,
    receiver: broadcast::Receiver<Event>,
}

impl Subscription {
    fn new(pattern: Pattern, receiver: broadcast::Receiver<Event>) -> Self {
        Subscription { pattern, receiver }
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    /// Wait for the next event matching this subscription's pattern.
    ///
    /// A lagged receiver (the in-process buffer overflowed) is treated as a permitted gap in
    /// at-least-once delivery, not an error: we skip ahead and keep waiting.
    pub async fn recv(&mut self) -> Result<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.pattern.matches(&event.event_type) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(Error::Closed),
            }
        }
    }
}

/// In-process fan-out: every [`DirectEvents::subscribe`] call gets its own broadcast receiver;
/// `emit` publishes to all of them. No cross-node delivery.
pub struct DirectEvents {
    sender: broadcast::Sender<Event>,
}

impl DirectEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        DirectEvents { sender }
    }
}

impl Default for DirectEvents {
    fn default() -> Self {
        DirectEvents::new(256)
    }
}

#[async_trait]
impl EventSystem for DirectEvents {
    async fn on_start(&self) -> Result<()> {
        Ok(())
    }

    async fn on_stop(&self) -> Result<()> {
        Ok(())
    }

    async fn emit(&self, event: Event) -> Result<()> {
        // An error here only means there are currently no subscribers; best-effort delivery
        // means that is not a failure worth reporting.
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe(&self, pattern: Pattern) -> Subscription {
        Subscription::new(pattern, self.sender.subscribe())
    }
}

/// Relays events sent over `transport` to the subset of the fleet subscribed to a matching
/// pattern, on top of the same in-process fan-out [`DirectEvents`] provides for local delivery.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Best-effort delivery of a relayed event message to `endpoint`. Failures are logged by
    /// the caller and never propagated: one unreachable subscriber must not block emission to
    /// the rest of the fleet.
    async fn publish(&self, endpoint: &str, message: iris_message::Message) -> std::result::Result<(), String>;
}

const MEMBERSHIP_ROOT: &str = "/iris/events/subscribers";

#[derive(Clone, Serialize, Deserialize)]
struct Membership {
    endpoint: String,
    patterns: Vec<Pattern>,
}

pub struct CoordinatorEvents {
    coordinator: Coordinator,
    endpoint: String,
    local: DirectEvents,
    transport: std::sync::Arc<dyn EventTransport>,
    patterns: Mutex<Vec<Pattern>>,
    registration: Mutex<Option<EphemeralRegistration>>,
    logger: slog::Logger,
}

impl CoordinatorEvents {
    pub fn new(
        coordinator: Coordinator,
        endpoint: impl Into<String>,
        transport: std::sync::Arc<dyn EventTransport>,
        logger: slog::Logger,
    ) -> Self {
        CoordinatorEvents {
            coordinator,
            endpoint: endpoint.into(),
            local: DirectEvents::default(),
            transport,
            patterns: Mutex::new(Vec::new()),
            registration: Mutex::new(None),
            logger,
        }
    }

    /// Feed an event relayed in from another node into local delivery only: it is not
    /// re-published to the fleet.
    pub async fn deliver_inbound(&self, message: &iris_message::Message) -> Result<()> {
        let event: Event =
            serde_json::from_value(message.body.clone()).map_err(|e| Error::Decode(e.to_string()))?;
        let _ = self.local.emit(event).await;
        Ok(())
    }

    async fn republish_membership(&self) -> Result<()> {
        let patterns = self.patterns.lock().expect("patterns poisoned").clone();
        let payload = serde_json::to_value(Membership {
            endpoint: self.endpoint.clone(),
            patterns,
        })
        .expect("Membership serializes infallibly");
        let path = format!("{MEMBERSHIP_ROOT}/{}", self.coordinator.node_id());
        let old = self.registration.lock().expect("registration poisoned").take();
        if let Some(old) = old {
            let _ = old.close().await;
        }
        let handle = self.coordinator.ephemeral_register(&path, payload).await?;
        *self.registration.lock().expect("registration poisoned") = Some(handle);
        Ok(())
    }

    async fn fleet_subscribers(&self) -> Result<Vec<Membership>> {
        let payloads = self.coordinator.discover(MEMBERSHIP_ROOT).await?;
        Ok(payloads
            .into_iter()
            .filter_map(|value| serde_json::from_value::<Membership>(value).ok())
            .collect())
    }
}

#[async_trait]
impl EventSystem for CoordinatorEvents {
    async fn on_start(&self) -> Result<()> {
        Ok(())
    }

    async fn on_stop(&self) -> Result<()> {
        let registration = self.registration.lock().expect("registration poisoned").take();
        if let Some(registration) = registration {
            let _ = registration.close().await;
        }
        Ok(())
    }

    async fn emit(&self, event: Event) -> Result<()> {
        let _ = self.local.emit(event.clone()).await;
        let subscribers = self.fleet_subscribers().await?;
        let message = iris_message::Message {
            id: uuid::Uuid::new_v4().to_string(),
            kind: iris_message::MessageKind::Ack,
            subject: event_subject(&event.event_type),
            source: self.endpoint.clone(),
            headers: iris_trace::headers(),
            body: serde_json::to_value(&event).expect("Event serializes infallibly"),
        };
        for subscriber in subscribers {
            if subscriber.endpoint == self.endpoint {
                continue;
            }
            if !subscriber.patterns.iter().any(|pattern| pattern.matches(&event.event_type)) {
                continue;
            }
            if let Err(error) = self.transport.publish(&subscriber.endpoint, message.clone()).await {
                slog::debug!(
                    self.logger,
                    "failed to relay event to subscriber";
                    "endpoint" => &subscriber.endpoint,
                    "event_type" => &event.event_type,
                    "error" => error,
                );
            }
        }
        Ok(())
    }

    /// Registers the pattern locally; the caller must also call [`CoordinatorEvents::resubscribe`]
    /// (an async step) to publish the updated subscription set to the coordinator. `subscribe`
    /// itself is synchronous per the [`EventSystem`] contract and cannot do that round trip.
    fn subscribe(&self, pattern: Pattern) -> Subscription {
        let mut patterns = self.patterns.lock().expect("patterns poisoned");
        if !patterns.contains(&pattern) {
            patterns.push(pattern.clone());
        }
        drop(patterns);
        self.local.subscribe(pattern)
    }

    async fn sync_subscriptions(&self) -> Result<()> {
        self.republish_membership().await
    }
}

impl CoordinatorEvents {
    /// Publish this node's current subscription set to the coordinator.
    ///
    /// The container calls this once after installing every declared subscription
    /// (`EventSystem::subscribe` itself cannot do this, since registering ephemeral state is
    /// async and `subscribe` is not).
    pub async fn resubscribe(&self) -> Result<()> {
        self.republish_membership().await
    }
}

/// In-process fixtures for exercising [`CoordinatorEvents`] across a simulated fleet without a
/// real container or transport.
#[cfg(any(test, feature = "test-fixture"))]
pub mod fixture {
    use std::collections::HashMap as Map;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::CoordinatorEvents;
    use super::EventTransport;

    /// Delivers relayed messages directly to other [`CoordinatorEvents`] registered under the
    /// same loopback, skipping any real network transport.
    #[derive(Default, Clone)]
    pub struct LoopbackTransport {
        nodes: Arc<StdMutex<Map<String, Arc<CoordinatorEvents>>>>,
    }

    impl LoopbackTransport {
        pub fn new() -> Self {
            LoopbackTransport::default()
        }

        pub fn register(&self, endpoint: impl Into<String>, events: Arc<CoordinatorEvents>) {
            self.nodes.lock().expect("nodes poisoned").insert(endpoint.into(), events);
        }
    }

    #[async_trait]
    impl EventTransport for LoopbackTransport {
        async fn publish(
            &self,
            endpoint: &str,
            message: iris_message::Message,
        ) -> std::result::Result<(), String> {
            let target = self
                .nodes
                .lock()
                .expect("nodes poisoned")
                .get(endpoint)
                .cloned()
                .ok_or_else(|| format!("no such loopback node: {endpoint}"))?;
            target
                .deliver_inbound(&message)
                .await
                .map_err(|e| e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn direct_events_delivers_to_matching_subscriber() {
        let events = DirectEvents::default();
        let mut sub = events.subscribe(Pattern::new("cluster.*"));
        events
            .emit(Event::new("cluster.up", "tcp://a", serde_json::json!({"id": 1})))
            .await
            .expect("emit");
        let received = sub.recv().await.expect("recv");
        assert_eq!(received.event_type, "cluster.up");
    }

    #[tokio::test]
    async fn direct_events_skips_non_matching_before_match() {
        let events = DirectEvents::default();
        let mut sub = events.subscribe(Pattern::new("cluster.up"));
        events
            .emit(Event::new("cluster.down", "tcp://a", Value::Null))
            .await
            .unwrap();
        events
            .emit(Event::new("cluster.up", "tcp://a", Value::Null))
            .await
            .unwrap();
        let received = tokio::time::timeout(std::time::Duration::from_millis(50), sub.recv())
            .await
            .expect("no timeout")
            .expect("recv");
        assert_eq!(received.event_type, "cluster.up");
    }

    #[test]
    fn pattern_wildcard_matches_prefix() {
        let pattern = Pattern::new("cluster.*");
        assert!(pattern.matches("cluster.up"));
        assert!(!pattern.matches("node.up"));
    }

    #[test]
    fn pattern_exact_match_only() {
        let pattern = Pattern::new("cluster.up");
        assert!(pattern.matches("cluster.up"));
        assert!(!pattern.matches("cluster.upgraded"));
    }

    #[tokio::test]
    async fn coordinator_events_relays_across_loopback_fleet() {
        use iris_coordinator::Coordinator;
        use iris_coordinator::MockBackend;
        use iris_coordinator::NodeId;

        let registry = iris_coordinator::MockRegistry::new();
        let transport = Arc::new(fixture::LoopbackTransport::new());
        let logger = slog::Logger::root(slog::Discard, slog::o!());

        let backend_a = MockBackend::with_registry(NodeId::new(), registry.clone());
        let coordinator_a = Coordinator::with_backend(Arc::new(backend_a));
        let events_a = Arc::new(CoordinatorEvents::new(
            coordinator_a,
            "tcp://a:1",
            transport.clone() as Arc<dyn EventTransport>,
            logger.clone(),
        ));
        transport.register("tcp://a:1", events_a.clone());

        let backend_b = MockBackend::with_registry(NodeId::new(), registry);
        let coordinator_b = Coordinator::with_backend(Arc::new(backend_b));
        let events_b = Arc::new(CoordinatorEvents::new(
            coordinator_b,
            "tcp://b:1",
            transport.clone() as Arc<dyn EventTransport>,
            logger,
        ));
        transport.register("tcp://b:1", events_b.clone());

        let mut sub_b = events_b.subscribe(Pattern::new("cluster.*"));
        events_b.resubscribe().await.expect("resubscribe");

        events_a
            .emit(Event::new("cluster.up", "tcp://a:1", serde_json::json!({"id": 7})))
            .await
            .expect("emit");

        let received = tokio::time::timeout(std::time::Duration::from_millis(200), sub_b.recv())
            .await
            .expect("no timeout")
            .expect("recv");
        assert_eq!(received.event_type, "cluster.up");
        assert_eq!(received.source, "tcp://a:1");
    }
}
