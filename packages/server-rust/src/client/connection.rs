//! Connection management for the local client endpoints.
//!
//! Provides per-connection backpressure via bounded mpsc channels and
//! lock-free concurrent connection tracking via `DashMap`. Each connection
//! carries the state the command layer needs: its endpoint kind, bound
//! port, event subscriptions, and the shutdown-reply slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;

/// Unique identifier for a connection, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Which endpoint a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// The 0660 endpoint: unprivileged commands only.
    Client,
    /// The 0600 endpoint: privileged commands allowed.
    Admin,
}

/// A client's answer to a TRY_SHUTDOWN poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownReply {
    #[default]
    Unknown,
    Yes,
    No,
}

/// Message to be sent outbound to a connection.
#[derive(Debug)]
pub enum OutboundMessage {
    /// A complete protocol frame.
    Frame(Bytes),
    /// Close the stream after draining.
    Close,
}

/// Mutable per-connection state.
#[derive(Debug, Default)]
pub struct ConnectionMetadata {
    /// Bound cluster port; 0 = unbound.
    pub port: u8,
    /// Receives event notifications.
    pub events: bool,
    /// Receives configuration-change messages.
    pub confchg: bool,
    pub shutdown_reply: ShutdownReply,
}

/// Handle to a single connection.
///
/// The bounded channel is the reply queue: the stream writer task drains
/// it, and a full channel is client backpressure.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub kind: EndpointKind,
    pub tx: mpsc::Sender<OutboundMessage>,
    pub metadata: RwLock<ConnectionMetadata>,
    pub connected_at: Instant,
}

impl ConnectionHandle {
    /// Attempts to queue a frame without blocking.
    ///
    /// Returns `false` if the queue is full or the connection has closed;
    /// senders treat both as "this client loses the message".
    #[must_use]
    pub fn try_send(&self, frame: Bytes) -> bool {
        self.tx.try_send(OutboundMessage::Frame(frame)).is_ok()
    }

    /// Queues a close marker; the writer shuts the stream down after
    /// flushing.
    pub fn request_close(&self) {
        let _ = self.tx.try_send(OutboundMessage::Close);
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    #[must_use]
    pub fn bound_port(&self) -> u8 {
        self.metadata.read().port
    }
}

/// Thread-safe registry of all active client connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Creates a new empty registry. Connection ids start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a new connection, returning its handle and the message
    /// receiver for the writer task.
    pub fn register(
        &self,
        kind: EndpointKind,
        queue_capacity: usize,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(queue_capacity);

        let handle = Arc::new(ConnectionHandle {
            id,
            kind,
            tx,
            metadata: RwLock::new(ConnectionMetadata::default()),
            connected_at: Instant::now(),
        });

        self.connections.insert(id, Arc::clone(&handle));
        (handle, rx)
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.remove(&id).map(|(_, handle)| handle)
    }

    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&id).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Sends a frame to every event-subscribed connection (or only to
    /// `target` when given). Full queues are skipped, as a slow client
    /// must not stall the cluster.
    pub fn notify(&self, frame: &Bytes, target: Option<ConnectionId>) {
        if let Some(id) = target {
            if let Some(handle) = self.get(id) {
                let _ = handle.try_send(frame.clone());
            }
            return;
        }
        for entry in &self.connections {
            let handle = entry.value();
            if handle.metadata.read().events {
                let _ = handle.try_send(frame.clone());
            }
        }
    }

    /// Sends a frame to every confchg-subscribed connection.
    pub fn notify_confchg(&self, frame: &Bytes) {
        for entry in &self.connections {
            let handle = entry.value();
            if handle.metadata.read().confchg {
                let _ = handle.try_send(frame.clone());
            }
        }
    }

    /// Clears all shutdown-reply slots and returns the number of
    /// event-subscribed connections that will be polled.
    pub fn begin_shutdown_poll(&self) -> usize {
        let mut count = 0;
        for entry in &self.connections {
            let mut meta = entry.value().metadata.write();
            meta.shutdown_reply = ShutdownReply::Unknown;
            if meta.events {
                count += 1;
            }
        }
        count
    }

    /// Tallies shutdown replies: (yes, no, outstanding).
    #[must_use]
    pub fn shutdown_poll_state(&self) -> (usize, usize, usize) {
        let mut yes = 0;
        let mut no = 0;
        let mut outstanding = 0;
        for entry in &self.connections {
            let meta = entry.value().metadata.read();
            if !meta.events {
                continue;
            }
            match meta.shutdown_reply {
                ShutdownReply::Yes => yes += 1,
                ShutdownReply::No => no += 1,
                ShutdownReply::Unknown => outstanding += 1,
            }
        }
        (yes, no, outstanding)
    }

    /// Removes and returns all connections. Used during shutdown.
    pub fn drain_all(&self) -> Vec<Arc<ConnectionHandle>> {
        let keys: Vec<ConnectionId> = self.connections.iter().map(|e| *e.key()).collect();
        let mut handles = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, handle)) = self.connections.remove(&key) {
                handles.push(handle);
            }
        }
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_count() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.count(), 0);

        let (h1, _rx1) = registry.register(EndpointKind::Client, 8);
        let (h2, _rx2) = registry.register(EndpointKind::Admin, 8);
        assert_eq!(registry.count(), 2);
        assert_eq!(h1.id, ConnectionId(1));
        assert_eq!(h2.id, ConnectionId(2));
        assert_eq!(h2.kind, EndpointKind::Admin);
    }

    #[test]
    fn remove_releases_connection() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = registry.register(EndpointKind::Client, 8);
        assert!(registry.remove(handle.id).is_some());
        assert!(registry.remove(handle.id).is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn try_send_reports_full_queue() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = registry.register(EndpointKind::Client, 2);

        assert!(handle.try_send(Bytes::from_static(b"1")));
        assert!(handle.try_send(Bytes::from_static(b"2")));
        assert!(!handle.try_send(Bytes::from_static(b"3")));
    }

    #[test]
    fn try_send_reports_disconnect() {
        let registry = ConnectionRegistry::new();
        let (handle, rx) = registry.register(EndpointKind::Client, 2);
        drop(rx);
        assert!(!handle.try_send(Bytes::from_static(b"1")));
        assert!(!handle.is_connected());
    }

    #[test]
    fn notify_reaches_only_subscribed_connections() {
        let registry = ConnectionRegistry::new();
        let (subscribed, mut rx1) = registry.register(EndpointKind::Client, 8);
        let (_plain, mut rx2) = registry.register(EndpointKind::Client, 8);
        subscribed.metadata.write().events = true;

        registry.notify(&Bytes::from_static(b"ev"), None);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn notify_unicast_ignores_subscription() {
        let registry = ConnectionRegistry::new();
        let (handle, mut rx) = registry.register(EndpointKind::Client, 8);

        registry.notify(&Bytes::from_static(b"ev"), Some(handle.id));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn shutdown_poll_counts_subscribers() {
        let registry = ConnectionRegistry::new();
        let (a, _rxa) = registry.register(EndpointKind::Client, 8);
        let (b, _rxb) = registry.register(EndpointKind::Client, 8);
        let (_c, _rxc) = registry.register(EndpointKind::Client, 8);
        a.metadata.write().events = true;
        b.metadata.write().events = true;

        assert_eq!(registry.begin_shutdown_poll(), 2);
        assert_eq!(registry.shutdown_poll_state(), (0, 0, 2));

        a.metadata.write().shutdown_reply = ShutdownReply::Yes;
        b.metadata.write().shutdown_reply = ShutdownReply::No;
        assert_eq!(registry.shutdown_poll_state(), (1, 1, 0));
    }

    #[test]
    fn drain_all_empties_registry() {
        let registry = ConnectionRegistry::new();
        let (_a, _rxa) = registry.register(EndpointKind::Client, 8);
        let (_b, _rxb) = registry.register(EndpointKind::Admin, 8);

        assert_eq!(registry.drain_all().len(), 2);
        assert_eq!(registry.count(), 0);
    }
}
