//! Per-peer connection table (C3): at most one [`Connection`] per peer endpoint, created on
//! first outbound send or first inbound message from that peer.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::codec::FramedWrite;

use iris_message::Message;
use iris_message::MessageCodec;

use crate::error::Error;
use crate::error::Result;

/// A point-in-time snapshot of [`Connection`] counters, safe to serialize or log.
#[derive(Clone, Debug, Serialize)]
pub struct ConnectionStats {
    pub endpoint: String,
    pub sent: u64,
    pub received: u64,
    pub created_at: std::time::SystemTime,
}

/// An outbound TCP connection dialed to a peer, identified by that peer's endpoint.
///
/// Writes are serialized behind an async mutex: a single `send_message` is atomic (the whole
/// packed message is written without interleaving), and concurrent senders to the same peer are
/// queued rather than corrupting the stream.
pub struct Connection {
    endpoint: String,
    writer: AsyncMutex<FramedWrite<OwnedWriteHalf, MessageCodec>>,
    sent: std::sync::atomic::AtomicU64,
    received: std::sync::atomic::AtomicU64,
    created_at: Instant,
    created_at_wall: std::time::SystemTime,
}

impl Connection {
    fn new(endpoint: String, writer: OwnedWriteHalf) -> Self {
        Connection {
            endpoint,
            writer: AsyncMutex::new(FramedWrite::new(writer, MessageCodec::default())),
            sent: std::sync::atomic::AtomicU64::new(0),
            received: std::sync::atomic::AtomicU64::new(0),
            created_at: Instant::now(),
            created_at_wall: std::time::SystemTime::now(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    async fn send(&self, message: Message) -> Result<()> {
        use futures::SinkExt;
        let mut writer = self.writer.lock().await;
        writer.send(message).await.map_err(Error::BadFrame)?;
        self.sent.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        crate::metrics::MESSAGES_SENT_TOTAL.inc();
        Ok(())
    }

    fn record_recv(&self) {
        self.received.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.get_mut().shutdown().await;
    }

    fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            endpoint: self.endpoint.clone(),
            sent: self.sent.load(std::sync::atomic::Ordering::Relaxed),
            received: self.received.load(std::sync::atomic::Ordering::Relaxed),
            created_at: self.created_at_wall,
        }
    }
}

/// The container's table of peer connections.
#[derive(Default)]
pub struct ConnectionTable {
    connections: Mutex<HashMap<String, std::sync::Arc<Connection>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        ConnectionTable::default()
    }

    /// Idempotent: dials `endpoint` exactly once, returning the existing connection on repeat
    /// calls. `on_connect` is invoked on every installed service exactly once per peer, the
    /// first time a connection to it is created.
    pub async fn connect<F, Fut>(&self, endpoint: &str, on_connect: F) -> Result<std::sync::Arc<Connection>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        if let Some(existing) = self.connections.lock().expect("connections poisoned").get(endpoint) {
            return Ok(existing.clone());
        }
        let address = strip_scheme(endpoint);
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| Error::LookupFailure(endpoint.to_string(), e.to_string()))?;
        let (_read, write) = stream.into_split();
        let connection = std::sync::Arc::new(Connection::new(endpoint.to_string(), write));

        // Re-check under the lock: another task may have connected to the same peer while we
        // were dialing. Only the task that actually wins the insert fires `on_connect`.
        let mut guard = self.connections.lock().expect("connections poisoned");
        let (connection, inserted) = match guard.entry(endpoint.to_string()) {
            std::collections::hash_map::Entry::Occupied(entry) => (entry.get().clone(), false),
            std::collections::hash_map::Entry::Vacant(entry) => {
                (entry.insert(connection).clone(), true)
            }
        };
        drop(guard);

        if inserted {
            on_connect().await;
            tokio::task::yield_now().await;
        }
        Ok(connection)
    }

    pub async fn disconnect(&self, endpoint: &str, hard: bool) {
        let removed = self.connections.lock().expect("connections poisoned").remove(endpoint);
        if let Some(connection) = removed {
            if hard {
                connection.close().await;
            }
        }
    }

    /// Record an inbound message from `endpoint`, dialing it if this is the first time we've
    /// seen it (so a reply can be sent back over the same logical connection).
    pub async fn record_recv<F, Fut>(&self, endpoint: &str, on_connect: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let connection = self.connect(endpoint, on_connect).await?;
        connection.record_recv();
        crate::metrics::MESSAGES_RECEIVED_TOTAL.inc();
        Ok(())
    }

    pub async fn send(&self, endpoint: &str, message: Message) -> Result<()> {
        let connection = self
            .connections
            .lock()
            .expect("connections poisoned")
            .get(endpoint)
            .cloned()
            .ok_or_else(|| Error::LookupFailure(endpoint.to_string(), "no connection".to_string()))?;
        connection.send(message).await
    }

    pub fn stats(&self) -> Vec<ConnectionStats> {
        self.connections
            .lock()
            .expect("connections poisoned")
            .values()
            .map(|c| c.stats())
            .collect()
    }

    pub async fn disconnect_all(&self) {
        let connections: Vec<_> = self
            .connections
            .lock()
            .expect("connections poisoned")
            .drain()
            .map(|(_, c)| c)
            .collect();
        for connection in connections {
            connection.close().await;
        }
    }
}

fn strip_scheme(endpoint: &str) -> &str {
    endpoint.strip_prefix("tcp://").unwrap_or(endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_is_idempotent_per_peer() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("tcp://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let table = ConnectionTable::new();
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls2 = calls.clone();
        let first = table
            .connect(&endpoint, || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
            })
            .await
            .expect("first connect");
        let calls3 = calls.clone();
        let second = table
            .connect(&endpoint, || {
                let calls = calls3.clone();
                async move {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
            })
            .await
            .expect("second connect");
        assert!(std::sync::Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
