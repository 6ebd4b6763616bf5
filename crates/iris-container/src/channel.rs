//! Request/reply channel machinery (C4): the server-side [`RequestChannel`] and client-side
//! [`ReplyChannel`] handles of a single RPC exchange, plus the container's pending-call table
//! that correlates inbound replies back to the [`ReplyChannel`] that is waiting on them.
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::sync::Weak;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;

use iris_message::Message;
use iris_message::MessageKind;

use crate::connection::ConnectionTable;
use crate::error::Error;
use crate::error::Result;

/// Server-side handle to an inbound request.
///
/// `ack()` is the one non-terminal operation: it marks the request as received without
/// preventing a later `reply`/`nack`/`error` call. Any of the other three close the channel;
/// a second terminal operation fails with [`Error::ChannelClosed`].
pub struct RequestChannel {
    request: Message,
    source_endpoint: String,
    connections: Weak<ConnectionTable>,
    closed: AtomicBool,
}

impl RequestChannel {
    pub(crate) fn new(request: Message, source_endpoint: String, connections: Weak<ConnectionTable>) -> Self {
        RequestChannel {
            request,
            source_endpoint,
            connections,
            closed: AtomicBool::new(false),
        }
    }

    pub fn request(&self) -> &Message {
        &self.request
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn take_terminal(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::ChannelClosed);
        }
        Ok(())
    }

    async fn deliver(&self, message: Message) -> Result<()> {
        let connections = self
            .connections
            .upgrade()
            .ok_or(Error::NotRunning)?;
        connections.send(&self.request.source, message).await
    }

    /// Acknowledge receipt without closing the channel.
    pub async fn ack(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let message = Message::ack(&self.request, self.source_endpoint.clone());
        self.deliver(message).await
    }

    /// Send a successful reply and close the channel.
    pub async fn reply(&self, body: Value) -> Result<()> {
        self.take_terminal()?;
        let message = Message::reply(&self.request, self.source_endpoint.clone(), body);
        self.deliver(message).await
    }

    /// Negatively acknowledge the request and close the channel.
    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.take_terminal()?;
        let message = Message::nack(&self.request, self.source_endpoint.clone(), requeue);
        self.deliver(message).await
    }

    /// Report a remote-visible error and close the channel.
    pub async fn error(&self, kind: &str, detail: impl Into<String>) -> Result<()> {
        self.take_terminal()?;
        let message = Message::error(&self.request, self.source_endpoint.clone(), kind, detail);
        self.deliver(message).await
    }
}

/// Client-side handle to an in-flight outbound request.
pub struct ReplyChannel {
    request: Message,
    receiver: mpsc::UnboundedReceiver<Message>,
    pending: std::sync::Arc<PendingTable>,
    closed: bool,
}

impl ReplyChannel {
    fn new(request: Message, receiver: mpsc::UnboundedReceiver<Message>, pending: std::sync::Arc<PendingTable>) -> Self {
        ReplyChannel {
            request,
            receiver,
            pending,
            closed: false,
        }
    }

    pub fn request(&self) -> &Message {
        &self.request
    }

    /// Wait for the next reply, or [`Error::Timeout`] if `timeout` elapses first.
    ///
    /// A terminal reply kind (`Rep`, `Nack`, `Err`) closes the channel and removes it from the
    /// pending table; `Ack` is delivered without closing, leaving the caller free to keep
    /// waiting for the eventual terminal reply.
    pub async fn recv(&mut self, deadline: Option<Duration>) -> Result<Message> {
        if self.closed {
            return Err(Error::ChannelClosed);
        }
        let next = match deadline {
            Some(deadline) => timeout(deadline, self.receiver.recv())
                .await
                .map_err(|_| Error::Timeout)?,
            None => self.receiver.recv().await,
        };
        let message = next.ok_or(Error::ChannelClosed)?;
        if is_terminal(&message.kind) {
            self.close();
        }
        match message.kind {
            MessageKind::Err => {
                let kind = message.body.get("kind").and_then(Value::as_str).unwrap_or("unknown");
                let detail = message.body.get("detail").and_then(Value::as_str).unwrap_or("");
                Err(Error::RpcError(kind.to_string(), detail.to_string()))
            }
            _ => Ok(message),
        }
    }

    /// Wait for a single terminal reply and close the channel.
    pub async fn get(&mut self, deadline: Option<Duration>) -> Result<Message> {
        loop {
            let message = self.recv(deadline).await?;
            if is_terminal(&message.kind) {
                return Ok(message);
            }
        }
    }

    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.pending.remove(&self.request.id);
        }
    }
}

impl Drop for ReplyChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn is_terminal(kind: &MessageKind) -> bool {
    matches!(kind, MessageKind::Rep | MessageKind::Nack | MessageKind::Err)
}

/// The container's table of in-flight outbound requests, keyed by request id.
///
/// For all requests `r` sent with id `i`, the `ReplyChannel` for `i` exists in this table from
/// send time until terminal receipt or timeout; after termination it is absent.
#[derive(Default)]
pub struct PendingTable {
    senders: Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>,
}

impl PendingTable {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(PendingTable::default())
    }

    /// Register a new in-flight request, returning the [`ReplyChannel`] the caller awaits.
    pub fn register(self: &std::sync::Arc<Self>, request: Message) -> ReplyChannel {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.senders
            .lock()
            .expect("pending table poisoned")
            .insert(request.id.clone(), sender);
        ReplyChannel::new(request, receiver, self.clone())
    }

    fn remove(&self, id: &str) {
        self.senders.lock().expect("pending table poisoned").remove(id);
    }

    /// Deliver an inbound reply to the channel waiting on `subject`.
    ///
    /// Returns `false` if no channel is registered under `subject` — the caller logs this at
    /// debug level, not as an error, since the requester may simply have cancelled.
    pub fn deliver(&self, subject: &str, message: Message) -> bool {
        let sender = self.senders.lock().expect("pending table poisoned").get(subject).cloned();
        match sender {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.senders.lock().expect("pending table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pending_table_round_trips_a_reply() {
        let pending = PendingTable::new();
        let request = Message::request("echo.pong", "tcp://a", serde_json::json!({"v": 7}));
        let mut channel = pending.register(request.clone());
        assert_eq!(pending.len(), 1);

        let reply = Message::reply(&request, "tcp://b", serde_json::json!({"v": 7}));
        assert!(pending.deliver(&request.id, reply));

        let received = channel.get(None).await.expect("get");
        assert_eq!(received.body, serde_json::json!({"v": 7}));
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn deliver_to_unknown_subject_is_not_an_error() {
        let pending = PendingTable::new();
        let request = Message::request("echo.pong", "tcp://a", Value::Null);
        let reply = Message::reply(&request, "tcp://b", Value::Null);
        assert!(!pending.deliver("unknown-subject", reply));
    }

    #[tokio::test]
    async fn recv_times_out_when_no_reply_arrives() {
        let pending = PendingTable::new();
        let request = Message::request("echo.pong", "tcp://a", Value::Null);
        let mut channel = pending.register(request);
        let result = channel.recv(Some(Duration::from_millis(10))).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn err_reply_surfaces_as_rpc_error() {
        let pending = PendingTable::new();
        let request = Message::request("echo.pong", "tcp://a", Value::Null);
        let mut channel = pending.register(request.clone());
        let error = Message::error(&request, "tcp://b", "bad_input", "missing field");
        assert!(pending.deliver(&request.id, error));
        let result = channel.get(None).await;
        assert!(matches!(result, Err(Error::RpcError(kind, _)) if kind == "bad_input"));
    }
}
