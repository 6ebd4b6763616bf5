//! `InstalledService` contract (data model §3): the abstract capability set a hosted service
//! interface exposes to its container — `{handle_request, on_start, on_stop, on_connect,
//! on_disconnect, dispatch_event, stats, configure}`.
use async_trait::async_trait;
use iris_events::Event;
use iris_events::Pattern;
use serde_json::Value;

use crate::channel::RequestChannel;
use crate::error::Result;

/// A named interface hosted by a container: RPC method table plus event subscriptions.
#[async_trait]
pub trait ServiceInterface: Send + Sync {
    /// Unique name this service is installed and advertised under.
    fn service_type(&self) -> &str;

    /// Whether `start` should advertise this service with the coordinator-backed registry.
    fn register_with_coordinator(&self) -> bool {
        true
    }

    /// Event patterns this service wants delivered to [`ServiceInterface::dispatch_event`].
    fn subscriptions(&self) -> Vec<Pattern> {
        Vec::new()
    }

    async fn on_start(&self) -> Result<()> {
        Ok(())
    }

    async fn configure(&self, _options: Value) -> Result<()> {
        Ok(())
    }

    async fn on_connect(&self, _endpoint: &str) {}

    async fn on_disconnect(&self, _endpoint: &str) {}

    async fn on_stop(&self) -> Result<()> {
        Ok(())
    }

    /// Handle `<service_type>.<method>`, where `method` is the part of the inbound subject
    /// after this service's own type has been split off.
    async fn handle_request(&self, method: &str, channel: &RequestChannel) -> Result<()>;

    /// Handle an inbound event whose type matches one of [`ServiceInterface::subscriptions`].
    /// Returns whether this service handled it, so the container can log events nobody claims.
    async fn dispatch_event(&self, _event: &Event) -> bool {
        false
    }

    fn stats(&self) -> Value {
        Value::Null
    }
}
