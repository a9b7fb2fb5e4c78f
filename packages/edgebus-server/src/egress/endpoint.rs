//! Hosted WebSocket endpoints and their connected consumers.
//!
//! Each WebSocket egress owns one [`WebSocketHostEndpoint`]. Consumers get a
//! bounded mpsc channel for backpressure; the receiver is drained by the
//! socket's write loop. The endpoint reports consumer-count transitions
//! (0 -> 1 and 1 -> 0) as [`ConsumerTransition`] events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use edgebus_core::EgressId;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::BusError;
use crate::network::config::ConnectionConfig;

/// Identifier of one connected consumer, unique within an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(pub u64);

/// Frame to be written to a consumer socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    /// A close frame with an optional reason.
    Close(Option<String>),
}

/// Error returned when pushing a frame to a consumer fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The consumer's queue stayed full for the whole timeout.
    Timeout,
    /// The consumer disconnected; the receiver was dropped.
    Disconnected,
}

/// Consumer-count edge reported by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerTransition {
    FirstConsumerAdded,
    LastConsumerRemoved,
}

/// Handle to a single connected consumer.
#[derive(Debug)]
pub struct ConsumerHandle {
    pub id: ConsumerId,
    pub tx: mpsc::Sender<OutboundFrame>,
    pub connected_at: Instant,
}

impl ConsumerHandle {
    /// Enqueues a frame without blocking. Returns `false` if the queue is
    /// full or the consumer is gone.
    #[must_use]
    pub fn try_send(&self, frame: OutboundFrame) -> bool {
        self.tx.try_send(frame).is_ok()
    }

    /// Enqueues a frame, waiting up to `timeout` for queue capacity.
    ///
    /// # Errors
    ///
    /// [`SendError::Timeout`] if the queue stayed full, or
    /// [`SendError::Disconnected`] if the consumer is gone.
    pub async fn send_timeout(
        &self,
        frame: OutboundFrame,
        timeout: Duration,
    ) -> Result<(), SendError> {
        match tokio::time::timeout(timeout, self.tx.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Disconnected),
            Err(_) => Err(SendError::Timeout),
        }
    }
}

/// One hosted WebSocket endpoint.
#[derive(Debug)]
pub struct WebSocketHostEndpoint {
    egress_id: EgressId,
    bind_path: String,
    config: ConnectionConfig,
    consumers: DashMap<ConsumerId, Arc<ConsumerHandle>>,
    next_id: AtomicU64,
    /// Serializes count changes so transitions are emitted in order.
    count: Mutex<usize>,
    transitions: mpsc::UnboundedSender<ConsumerTransition>,
}

impl WebSocketHostEndpoint {
    /// Creates an endpoint and the receiver of its consumer transitions.
    #[must_use]
    pub fn new(
        egress_id: EgressId,
        bind_path: String,
        config: ConnectionConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ConsumerTransition>) {
        let (transitions, rx) = mpsc::unbounded_channel();
        let endpoint = Arc::new(Self {
            egress_id,
            bind_path,
            config,
            consumers: DashMap::new(),
            next_id: AtomicU64::new(1),
            count: Mutex::new(0),
            transitions,
        });
        (endpoint, rx)
    }

    #[must_use]
    pub fn egress_id(&self) -> EgressId {
        self.egress_id
    }

    #[must_use]
    pub fn bind_path(&self) -> &str {
        &self.bind_path
    }

    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Adds a consumer, returning its handle and the frame receiver for the
    /// socket write loop.
    pub fn register(&self) -> (Arc<ConsumerHandle>, mpsc::Receiver<OutboundFrame>) {
        let id = ConsumerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.config.outbound_channel_capacity.max(1));
        let handle = Arc::new(ConsumerHandle {
            id,
            tx,
            connected_at: Instant::now(),
        });

        let mut count = self.count.lock();
        self.consumers.insert(id, Arc::clone(&handle));
        *count += 1;
        debug!(bind_path = %self.bind_path, consumer = id.0, consumers = *count, "consumer added");
        if *count == 1 {
            let _ = self.transitions.send(ConsumerTransition::FirstConsumerAdded);
        }
        (handle, rx)
    }

    /// Removes a consumer. Unknown ids are ignored.
    pub fn remove(&self, id: ConsumerId) -> Option<Arc<ConsumerHandle>> {
        let mut count = self.count.lock();
        let (_, handle) = self.consumers.remove(&id)?;
        *count -= 1;
        debug!(bind_path = %self.bind_path, consumer = id.0, consumers = *count, "consumer removed");
        if *count == 0 {
            let _ = self.transitions.send(ConsumerTransition::LastConsumerRemoved);
        }
        Some(handle)
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        *self.count.lock()
    }

    /// Pushes a text frame to every consumer. Returns how many accepted it.
    ///
    /// A consumer accepts a frame once it sits in its outbound queue, before
    /// the session writes it to the socket. A session that ends with frames
    /// still queued loses them, and the channel has already counted them as
    /// delivered.
    pub async fn broadcast(&self, text: &str) -> usize {
        let handles: Vec<Arc<ConsumerHandle>> =
            self.consumers.iter().map(|e| Arc::clone(e.value())).collect();

        let mut accepted = 0;
        for handle in handles {
            match handle
                .send_timeout(OutboundFrame::Text(text.to_string()), self.config.send_timeout)
                .await
            {
                Ok(()) => accepted += 1,
                Err(e) => debug!(consumer = handle.id.0, error = ?e, "push to consumer failed"),
            }
        }
        accepted
    }

    /// Sends a close frame to every consumer and forgets them.
    pub fn close_all(&self, reason: &str) -> usize {
        let ids: Vec<ConsumerId> = self.consumers.iter().map(|e| *e.key()).collect();
        let mut closed = 0;
        for id in ids {
            if let Some(handle) = self.remove(id) {
                let _ = handle.try_send(OutboundFrame::Close(Some(reason.to_string())));
                closed += 1;
            }
        }
        closed
    }
}

/// Endpoints reachable through the HTTP server, keyed by egress.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    endpoints: DashMap<EgressId, Arc<WebSocketHostEndpoint>>,
}

impl EndpointRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mounts an endpoint.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidOperation`] if the egress already has an endpoint.
    pub fn mount(&self, endpoint: Arc<WebSocketHostEndpoint>) -> Result<(), BusError> {
        match self.endpoints.entry(endpoint.egress_id()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(BusError::InvalidOperation(format!(
                "endpoint already mounted at {}",
                endpoint.bind_path()
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(endpoint);
                Ok(())
            }
        }
    }

    pub fn unmount(&self, egress_id: EgressId) -> Option<Arc<WebSocketHostEndpoint>> {
        self.endpoints.remove(&egress_id).map(|(_, e)| e)
    }

    #[must_use]
    pub fn get(&self, egress_id: EgressId) -> Option<Arc<WebSocketHostEndpoint>> {
        self.endpoints.get(&egress_id).map(|e| Arc::clone(e.value()))
    }

    /// Connected consumers across all endpoints.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.endpoints.iter().map(|e| e.value().consumer_count()).sum()
    }

    /// Closes every consumer of every endpoint. Returns how many were closed.
    pub fn close_all(&self, reason: &str) -> usize {
        let endpoints: Vec<Arc<WebSocketHostEndpoint>> =
            self.endpoints.iter().map(|e| Arc::clone(e.value())).collect();
        endpoints.iter().map(|e| e.close_all(reason)).sum()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> (Arc<WebSocketHostEndpoint>, mpsc::UnboundedReceiver<ConsumerTransition>) {
        let egress_id = EgressId::generate();
        WebSocketHostEndpoint::new(
            egress_id,
            format!("/websockethost/{}", egress_id.uuid()),
            ConnectionConfig::default(),
        )
    }

    #[test]
    fn transitions_fire_only_on_edges() {
        let (endpoint, mut transitions) = endpoint();

        let (a, _rx_a) = endpoint.register();
        let (b, _rx_b) = endpoint.register();
        assert_eq!(endpoint.consumer_count(), 2);
        endpoint.remove(a.id);
        endpoint.remove(b.id);
        assert!(endpoint.remove(b.id).is_none());

        assert_eq!(
            transitions.try_recv().unwrap(),
            ConsumerTransition::FirstConsumerAdded
        );
        assert_eq!(
            transitions.try_recv().unwrap(),
            ConsumerTransition::LastConsumerRemoved
        );
        assert!(transitions.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_counts_accepting_consumers() {
        let (endpoint, _transitions) = endpoint();
        let (_a, mut rx_a) = endpoint.register();
        let (_b, rx_b) = endpoint.register();
        drop(rx_b);

        assert_eq!(endpoint.broadcast("hello").await, 1);
        assert_eq!(rx_a.recv().await, Some(OutboundFrame::Text("hello".to_string())));
    }

    #[tokio::test]
    async fn queued_frame_counts_even_if_session_ends_unflushed() {
        let (endpoint, _transitions) = endpoint();
        let (_consumer, mut rx) = endpoint.register();

        // Nothing reads the queue, yet the frame already counts.
        assert_eq!(endpoint.broadcast("queued").await, 1);
        rx.close();
        assert_eq!(rx.recv().await, Some(OutboundFrame::Text("queued".to_string())));
        drop(rx);

        assert_eq!(endpoint.broadcast("after").await, 0);
        assert_eq!(endpoint.consumer_count(), 1);
    }

    #[test]
    fn close_all_sends_close_and_empties() {
        let (endpoint, _transitions) = endpoint();
        let (_a, mut rx) = endpoint.register();
        assert_eq!(endpoint.close_all("bye"), 1);
        assert_eq!(endpoint.consumer_count(), 0);
        assert_eq!(
            rx.try_recv().unwrap(),
            OutboundFrame::Close(Some("bye".to_string()))
        );
    }

    #[test]
    fn registry_rejects_second_mount() {
        let registry = EndpointRegistry::new();
        let (endpoint, _transitions) = endpoint();
        registry.mount(Arc::clone(&endpoint)).unwrap();
        assert!(matches!(
            registry.mount(Arc::clone(&endpoint)),
            Err(BusError::InvalidOperation(_))
        ));
        assert!(registry.get(endpoint.egress_id()).is_some());
        registry.unmount(endpoint.egress_id());
        assert!(registry.is_empty());
    }
}
