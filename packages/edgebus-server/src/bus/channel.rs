//! Delivery channel contract shared by bus backends and egress adapters.
//!
//! A channel ties one subscriber (an egress) to one topic. It owns a FIFO
//! queue of messages and a dynamic set of [`ChannelHandler`]s. For the head
//! message the backend builds a [`ChannelEvent`], fans it out to every
//! registered handler, and inspects the resulting [`DeliveryMark`]: the head
//! is consumed only when every handler succeeded and none marked the event as
//! not delivered.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use edgebus_core::{EgressId, Message, TopicId};
use parking_lot::Mutex;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::error::BusError;

/// Subscriber identity: one retained channel per (topic, egress) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey {
    pub topic_id: TopicId,
    pub egress_id: EgressId,
}

impl ChannelKey {
    #[must_use]
    pub fn new(topic_id: TopicId, egress_id: EgressId) -> Self {
        Self {
            topic_id,
            egress_id,
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.topic_id, self.egress_id)
    }
}

/// Handler-reported outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryMark {
    /// No handler reported an outcome yet.
    Pending,
    Delivered(Value),
    NotDelivered(Value),
}

/// One message offered to the handlers of a channel.
#[derive(Debug)]
pub struct ChannelEvent {
    key: ChannelKey,
    message: Arc<Message>,
    mark: Mutex<DeliveryMark>,
}

impl ChannelEvent {
    #[must_use]
    pub fn new(key: ChannelKey, message: Arc<Message>) -> Self {
        Self {
            key,
            message,
            mark: Mutex::new(DeliveryMark::Pending),
        }
    }

    #[must_use]
    pub fn key(&self) -> ChannelKey {
        self.key
    }

    #[must_use]
    pub fn message(&self) -> &Arc<Message> {
        &self.message
    }

    /// Records a successful push. Does not override an earlier
    /// `NotDelivered` from another handler.
    pub fn mark_delivered(&self, evidence: Value) {
        let mut mark = self.mark.lock();
        if !matches!(*mark, DeliveryMark::NotDelivered(_)) {
            *mark = DeliveryMark::Delivered(evidence);
        }
    }

    /// Records a failed push; the message stays queued.
    pub fn mark_not_delivered(&self, evidence: Value) {
        *self.mark.lock() = DeliveryMark::NotDelivered(evidence);
    }

    #[must_use]
    pub fn mark(&self) -> DeliveryMark {
        self.mark.lock().clone()
    }
}

/// Receives channel events. Implemented by egress adapters.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    /// Attempts delivery of `event`. Returning an error counts as a failed
    /// attempt; the message is retried on a later tick.
    async fn handle(&self, ctx: &ExecutionContext, event: &ChannelEvent) -> anyhow::Result<()>;
}

/// A retained subscriber channel.
#[async_trait]
pub trait Channel: Send + Sync {
    fn key(&self) -> ChannelKey;

    fn add_handler(&self, handler: Arc<dyn ChannelHandler>);

    /// Removes a handler by identity. Returns whether it was registered.
    fn remove_handler(&self, handler: &Arc<dyn ChannelHandler>) -> bool;

    /// Resumes delivery if messages are pending.
    fn wake_up(&self);

    /// Stops delivery and releases the retention. Queued messages are kept.
    async fn dispose(&self);
}

/// Deferred retain of one channel, handed to egress adapters.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    fn key(&self) -> ChannelKey;

    /// Retains the channel.
    ///
    /// # Errors
    ///
    /// Fails with [`BusError::InvalidOperation`] if the channel is already
    /// retained.
    async fn create_channel(&self, ctx: &ExecutionContext) -> Result<Arc<dyn Channel>, BusError>;
}

/// Ordered handler list with identity-based removal.
#[derive(Default)]
pub struct HandlerSet {
    handlers: parking_lot::RwLock<Vec<Arc<dyn ChannelHandler>>>,
}

impl HandlerSet {
    pub fn add(&self, handler: Arc<dyn ChannelHandler>) {
        self.handlers.write().push(handler);
    }

    pub fn remove(&self, handler: &Arc<dyn ChannelHandler>) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|h| !Arc::ptr_eq(h, handler));
        handlers.len() != before
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<dyn ChannelHandler>> {
        self.handlers.read().clone()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use bytes::Bytes;
    use edgebus_core::{IngressId, MessageId};
    use serde_json::json;

    use super::*;

    fn event() -> ChannelEvent {
        let message = Message {
            message_id: MessageId::generate(),
            ingress_id: IngressId::generate(),
            headers: BTreeMap::new(),
            media_type: "application/json".to_string(),
            ingress_body: Bytes::new(),
            transformed_body: Bytes::new(),
            labels: Vec::new(),
        };
        ChannelEvent::new(
            ChannelKey::new(TopicId::generate(), EgressId::generate()),
            Arc::new(message),
        )
    }

    #[test]
    fn not_delivered_is_sticky() {
        let event = event();
        assert_eq!(event.mark(), DeliveryMark::Pending);
        event.mark_not_delivered(json!({"consumers": 0}));
        event.mark_delivered(json!({"status": 200}));
        assert_eq!(event.mark(), DeliveryMark::NotDelivered(json!({"consumers": 0})));
    }

    struct Nop;

    #[async_trait]
    impl ChannelHandler for Nop {
        async fn handle(&self, _: &ExecutionContext, _: &ChannelEvent) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn handler_set_removes_by_identity() {
        let set = HandlerSet::default();
        let a: Arc<dyn ChannelHandler> = Arc::new(Nop);
        let b: Arc<dyn ChannelHandler> = Arc::new(Nop);
        set.add(Arc::clone(&a));
        set.add(Arc::clone(&b));

        assert!(set.remove(&a));
        assert!(!set.remove(&a));
        assert_eq!(set.snapshot().len(), 1);
        assert!(Arc::ptr_eq(&set.snapshot()[0], &b));
    }
}
