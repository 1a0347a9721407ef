use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio::sync::{mpsc, oneshot};
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use nudge_protocol::{PrincipalId, WireEvent};

/// Unique identifier for one live connection.
pub type ConnectionId = Uuid;

/// Outbound queue of frames for one connection.
pub type FrameReceiver = mpsc::Receiver<Frame>;

/// One serialized event queued for a connection.
///
/// Frames pushed with [`ConnectionRegistry::deliver_confirmed`] carry an
/// acknowledgement the transport must resolve once the write finished.
/// Dropping an unacknowledged frame counts as a failed write.
#[derive(Debug)]
pub struct Frame {
    payload: Arc<str>,
    ack: Option<oneshot::Sender<bool>>,
}

impl Frame {
    pub fn text(&self) -> &str {
        &self.payload
    }

    /// Report whether the frame reached the wire.
    pub fn ack(mut self, written: bool) {
        if let Some(ack) = self.ack.take() {
            let _ = ack.send(written);
        }
    }
}

/// Handle to one open duplex channel, owned by exactly one principal.
///
/// The registry only pushes already-serialized frames into a bounded queue;
/// the transport task drains the queue and watches `closed` to know when the
/// registry gave up on it.
#[derive(Clone, Debug)]
pub struct Connection {
    id: ConnectionId,
    tx: mpsc::Sender<Frame>,
    closed: CancellationToken,
}

impl Connection {
    pub fn new(capacity: usize) -> (Self, FrameReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Self {
            id: Uuid::new_v4(),
            tx,
            closed: CancellationToken::new(),
        };
        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Cancelled once the registry has dropped this connection.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    fn push(&self, frame: Frame) -> Result<(), TrySendError<Frame>> {
        self.tx.try_send(frame)
    }
}

/// Tracks live connections per principal and fans events out to them.
///
/// `DashMap` shards the map, so each principal's connection set is guarded by
/// its shard lock: a push to the set and the removal of a failed member happen
/// under the same guard, and unrelated principals rarely contend.
pub struct ConnectionRegistry {
    connections: DashMap<PrincipalId, Vec<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    pub fn register(&self, principal_id: PrincipalId, connection: Connection) {
        let mut set = self.connections.entry(principal_id).or_default();
        set.push(connection);
        info!(principal_id, connections = set.len(), "connection registered");
    }

    /// Remove one connection. Returns false if it was not registered.
    pub fn unregister(&self, principal_id: PrincipalId, connection_id: ConnectionId) -> bool {
        let removed = match self.connections.get_mut(&principal_id) {
            Some(mut set) => {
                let before = set.len();
                set.retain(|c| c.id != connection_id);
                let removed = set.len() != before;
                if removed {
                    info!(principal_id, remaining = set.len(), "connection unregistered");
                }
                removed
            }
            None => false,
        };
        self.drop_if_empty(principal_id);
        removed
    }

    /// Queue `event` on every connection of `principal_id`.
    ///
    /// Returns true iff at least one connection accepted the frame into its
    /// queue. A principal with no live connections is the normal offline
    /// case and yields false.
    pub fn deliver(&self, principal_id: PrincipalId, event: &WireEvent) -> bool {
        let Some(payload) = serialize(event) else {
            return false;
        };
        self.push_each(principal_id, || Frame {
            payload: Arc::clone(&payload),
            ack: None,
        }) > 0
    }

    /// Like [`deliver`](Self::deliver), but waits up to `wait` for the
    /// transports to write the frame. Returns true iff at least one
    /// connection confirmed the write.
    pub async fn deliver_confirmed(
        &self,
        principal_id: PrincipalId,
        event: &WireEvent,
        wait: Duration,
    ) -> bool {
        let Some(payload) = serialize(event) else {
            return false;
        };

        let mut acks = FuturesUnordered::new();
        let queued = self.push_each(principal_id, || {
            let (tx, rx) = oneshot::channel();
            acks.push(rx);
            Frame {
                payload: Arc::clone(&payload),
                ack: Some(tx),
            }
        });
        if queued == 0 {
            return false;
        }

        let confirmed = async {
            while let Some(written) = acks.next().await {
                if matches!(written, Ok(true)) {
                    return true;
                }
            }
            false
        };
        match tokio::time::timeout(wait, confirmed).await {
            Ok(confirmed) => confirmed,
            Err(_) => {
                warn!(principal_id, queued, "no connection confirmed the write in time");
                false
            }
        }
    }

    /// Push `event` to every connection of every principal. Returns how many
    /// connections accepted it; failures are swallowed and unregistered.
    pub fn broadcast(&self, event: &WireEvent) -> usize {
        let Some(payload) = serialize(event) else {
            return 0;
        };

        let mut delivered = 0usize;
        let mut emptied = Vec::new();
        for mut entry in self.connections.iter_mut() {
            let principal_id = *entry.key();
            entry.value_mut().retain(|conn| {
                let frame = Frame {
                    payload: Arc::clone(&payload),
                    ack: None,
                };
                match conn.push(frame) {
                    Ok(()) => {
                        delivered += 1;
                        true
                    }
                    Err(e) => {
                        warn!(principal_id, connection_id = %conn.id, error = %e, "broadcast push failed");
                        conn.close();
                        false
                    }
                }
            });
            if entry.value().is_empty() {
                emptied.push(principal_id);
            }
        }

        for principal_id in emptied {
            self.drop_if_empty(principal_id);
        }
        delivered
    }

    pub fn connected_principals(&self) -> Vec<PrincipalId> {
        self.connections.iter().map(|e| *e.key()).collect()
    }

    pub fn is_connected(&self, principal_id: PrincipalId) -> bool {
        self.connection_count(principal_id) > 0
    }

    pub fn connection_count(&self, principal_id: PrincipalId) -> usize {
        self.connections
            .get(&principal_id)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    // Queues one frame per connection and drops the ones that refuse it.
    // The shard guard is released before returning.
    fn push_each<F>(&self, principal_id: PrincipalId, mut frame: F) -> usize
    where
        F: FnMut() -> Frame,
    {
        let queued = match self.connections.get_mut(&principal_id) {
            Some(mut set) => {
                let mut queued = 0usize;
                set.retain(|conn| {
                    if conn.is_closed() {
                        debug!(principal_id, connection_id = %conn.id, "skipping closed connection");
                        conn.close();
                        return false;
                    }
                    match conn.push(frame()) {
                        Ok(()) => {
                            queued += 1;
                            true
                        }
                        Err(e) => {
                            warn!(principal_id, connection_id = %conn.id, error = %e, "push failed, dropping connection");
                            conn.close();
                            false
                        }
                    }
                });
                queued
            }
            None => {
                debug!(principal_id, "no live connections");
                0
            }
        };

        self.drop_if_empty(principal_id);
        queued
    }

    // Must not be called while holding a guard on the same key.
    fn drop_if_empty(&self, principal_id: PrincipalId) {
        self.connections
            .remove_if(&principal_id, |_, set| set.is_empty());
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn serialize(event: &WireEvent) -> Option<Arc<str>> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            warn!(error = %e, "failed to serialize event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nudge_protocol::EventKind;

    fn event() -> WireEvent {
        WireEvent::new(EventKind::Pong, serde_json::json!({}))
    }

    #[test]
    fn deliver_to_offline_principal_returns_false() {
        let registry = ConnectionRegistry::new();
        for principal in [0, 1, 42, i64::MAX] {
            assert!(!registry.deliver(principal, &event()));
        }
        assert!(registry.connected_principals().is_empty());
    }

    #[tokio::test]
    async fn deliver_fans_out_to_every_connection() {
        let registry = ConnectionRegistry::new();
        let (a1, mut rx1) = Connection::new(4);
        let (a2, mut rx2) = Connection::new(4);
        let (b, mut rx_b) = Connection::new(4);
        registry.register(1, a1);
        registry.register(1, a2);
        registry.register(2, b);

        assert!(registry.deliver(1, &event()));

        let f1 = rx1.recv().await.unwrap();
        let f2 = rx2.recv().await.unwrap();
        // Serialized once and shared.
        assert!(Arc::ptr_eq(&f1.payload, &f2.payload));
        let parsed: WireEvent = serde_json::from_str(f1.text()).unwrap();
        assert_eq!(parsed.kind, EventKind::Pong);
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn unregister_last_connection_drops_principal() {
        let registry = ConnectionRegistry::new();
        let (c1, _rx1) = Connection::new(1);
        let (c2, _rx2) = Connection::new(1);
        let (id1, id2) = (c1.id(), c2.id());
        registry.register(5, c1);
        registry.register(5, c2);

        assert!(registry.unregister(5, id1));
        assert_eq!(registry.connection_count(5), 1);
        assert!(registry.unregister(5, id2));
        assert!(!registry.is_connected(5));
        assert!(registry.connected_principals().is_empty());
        assert!(!registry.unregister(5, id2));
    }

    #[test]
    fn force_closed_connection_is_dropped_on_deliver() {
        let registry = ConnectionRegistry::new();
        let (conn, rx) = Connection::new(1);
        let token = conn.closed_token();
        let handle = conn.clone();
        registry.register(9, conn);
        assert!(!handle.is_closed());

        // Transport went away.
        drop(rx);

        assert!(!registry.deliver(9, &event()));
        assert!(token.is_cancelled());
        assert!(handle.is_closed());
        assert!(!registry.connected_principals().contains(&9));
        assert!(!registry.deliver(9, &event()));
    }

    #[test]
    fn full_queue_counts_as_failed_push() {
        let registry = ConnectionRegistry::new();
        let (slow, _slow_rx) = Connection::new(1);
        let (fast, mut fast_rx) = Connection::new(8);
        let slow_token = slow.closed_token();
        registry.register(3, slow);
        registry.register(3, fast);

        assert!(registry.deliver(3, &event()));
        assert!(fast_rx.try_recv().is_ok());
        // Second push overflows the slow connection's queue.
        assert!(registry.deliver(3, &event()));
        assert!(slow_token.is_cancelled());
        assert_eq!(registry.connection_count(3), 1);
    }

    #[tokio::test]
    async fn broadcast_reaches_all_and_prunes_failures() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = Connection::new(2);
        let (b, rx_b) = Connection::new(2);
        let (c, mut rx_c) = Connection::new(2);
        registry.register(1, a);
        registry.register(2, b);
        registry.register(3, c);
        drop(rx_b);

        assert_eq!(registry.broadcast(&event()), 2);
        assert!(rx_a.recv().await.is_some());
        assert!(rx_c.recv().await.is_some());

        let mut connected = registry.connected_principals();
        connected.sort();
        assert_eq!(connected, vec![1, 3]);
    }

    #[tokio::test]
    async fn concurrent_register_and_deliver_keep_sets_consistent() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let (conn, rx) = Connection::new(4);
                let id = conn.id();
                registry.register(i % 4, conn);
                registry.deliver(i % 4, &event());
                drop(rx);
                registry.unregister(i % 4, id);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(registry.connected_principals().is_empty());
    }

    #[tokio::test]
    async fn confirmed_delivery_waits_for_the_transport() {
        let registry = ConnectionRegistry::new();
        let (conn, mut rx) = Connection::new(4);
        registry.register(1, conn);

        let transport = tokio::spawn(async move {
            let frame = rx.recv().await.unwrap();
            let parsed: WireEvent = serde_json::from_str(frame.text()).unwrap();
            frame.ack(true);
            parsed.kind
        });

        assert!(registry.deliver_confirmed(1, &event(), Duration::from_secs(5)).await);
        assert_eq!(transport.await.unwrap(), EventKind::Pong);
    }

    #[tokio::test]
    async fn undrained_queue_is_not_a_confirmed_delivery() {
        let registry = ConnectionRegistry::new();
        let (conn, rx) = Connection::new(4);
        registry.register(1, conn);

        // Queued but never written.
        assert!(!registry.deliver_confirmed(1, &event(), Duration::from_millis(50)).await);

        // Transport dies with the frame still queued.
        let dropper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(rx);
        });
        assert!(!registry.deliver_confirmed(1, &event(), Duration::from_secs(5)).await);
        dropper.await.unwrap();
    }

    #[tokio::test]
    async fn one_confirming_connection_is_enough() {
        let registry = ConnectionRegistry::new();
        let (stalled, _stalled_rx) = Connection::new(4);
        let (failing, mut failing_rx) = Connection::new(4);
        let (healthy, mut healthy_rx) = Connection::new(4);
        registry.register(2, stalled);
        registry.register(2, failing);
        registry.register(2, healthy);

        tokio::spawn(async move {
            failing_rx.recv().await.unwrap().ack(false);
        });
        tokio::spawn(async move {
            healthy_rx.recv().await.unwrap().ack(true);
        });

        assert!(registry.deliver_confirmed(2, &event(), Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn confirmed_delivery_to_offline_principal_is_immediate() {
        let registry = ConnectionRegistry::new();
        let ev = event();
        let attempt = registry.deliver_confirmed(8, &ev, Duration::from_secs(60));
        let delivered = tokio::time::timeout(Duration::from_secs(1), attempt).await;
        assert_eq!(delivered.ok(), Some(false));
    }
}
