//! In-process bus backend.
//!
//! Every (topic, egress) pair owns a FIFO queue that lives as long as the
//! backend; retaining a channel attaches a poller to that queue. A channel is
//! either **Idle** (no poller task) or **Active** (a poller ticks on a fixed
//! interval). Each tick offers the head message to every registered handler:
//! success pops the head, failure leaves it for the next tick. An empty queue,
//! or a channel with no handlers, returns the channel to Idle.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use edgebus_core::{DeliveryData, DeliveryStatus, Egress, EgressId, Ingress, Message, Topic, TopicId};
use futures_util::future::join_all;
use metrics::counter;
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info_span, warn, Instrument};

use super::channel::{Channel, ChannelEvent, ChannelHandler, ChannelKey, DeliveryMark, HandlerSet};
use super::delivery::DeliveryObserver;
use super::engine::BusBackend;
use crate::context::ExecutionContext;
use crate::error::BusError;

type MessageQueue = Arc<Mutex<VecDeque<Arc<Message>>>>;
type RetainedChannels = Arc<DashMap<ChannelKey, Arc<ChannelCore>>>;

/// In-process [`BusBackend`] with polling channels.
pub struct LocalBusBackend {
    poll_interval: Duration,
    observer: Arc<dyn DeliveryObserver>,
    queues: DashMap<TopicId, DashMap<EgressId, MessageQueue>>,
    retained: RetainedChannels,
}

impl LocalBusBackend {
    #[must_use]
    pub fn new(poll_interval: Duration, observer: Arc<dyn DeliveryObserver>) -> Self {
        Self {
            poll_interval,
            observer,
            queues: DashMap::new(),
            retained: Arc::new(DashMap::new()),
        }
    }

    fn queue(&self, key: ChannelKey) -> MessageQueue {
        let topic = self.queues.entry(key.topic_id).or_default();
        let queue = topic.entry(key.egress_id).or_default();
        Arc::clone(&queue)
    }

    /// Number of messages waiting for the pair, if it has a queue.
    #[must_use]
    pub fn queue_len(&self, key: ChannelKey) -> Option<usize> {
        let topic = self.queues.get(&key.topic_id)?;
        let queue = topic.get(&key.egress_id)?;
        let len = queue.lock().len();
        Some(len)
    }

    /// Whether the pair is currently retained.
    #[must_use]
    pub fn is_retained(&self, key: ChannelKey) -> bool {
        self.retained.contains_key(&key)
    }
}

#[async_trait]
impl BusBackend for LocalBusBackend {
    async fn on_publish(
        &self,
        _ctx: &ExecutionContext,
        ingress: &Ingress,
        topic: &Topic,
        message: Arc<Message>,
    ) -> Result<(), BusError> {
        let mut fed = Vec::new();
        if let Some(egresses) = self.queues.get(&topic.topic_id) {
            for entry in egresses.iter() {
                entry.value().lock().push_back(Arc::clone(&message));
                fed.push(ChannelKey::new(topic.topic_id, *entry.key()));
            }
        }
        if fed.is_empty() {
            debug!(
                topic = %topic.topic_name,
                ingress_id = %ingress.ingress_id,
                "no subscribers for topic"
            );
        }
        for key in fed {
            let core = self.retained.get(&key).map(|c| Arc::clone(&c));
            if let Some(core) = core {
                core.wake_up();
            }
        }
        Ok(())
    }

    async fn on_register_topic(
        &self,
        _ctx: &ExecutionContext,
        topic: &Topic,
    ) -> Result<(), BusError> {
        self.queues.entry(topic.topic_id).or_default();
        Ok(())
    }

    async fn on_register_egress(
        &self,
        _ctx: &ExecutionContext,
        egress: &Egress,
    ) -> Result<(), BusError> {
        for topic_id in &egress.source_topic_ids {
            self.queue(ChannelKey::new(*topic_id, egress.egress_id));
        }
        Ok(())
    }

    async fn on_retain_channel(
        &self,
        _ctx: &ExecutionContext,
        topic: &Topic,
        egress: &Egress,
    ) -> Result<Arc<dyn Channel>, BusError> {
        let key = ChannelKey::new(topic.topic_id, egress.egress_id);
        let queue = self.queue(key);
        let core = match self.retained.entry(key) {
            Entry::Occupied(_) => {
                return Err(BusError::InvalidOperation(format!(
                    "cannot retain channel twice: {key}"
                )));
            }
            Entry::Vacant(slot) => {
                let core = ChannelCore::new(
                    key,
                    queue,
                    self.poll_interval,
                    Arc::clone(&self.observer),
                );
                slot.insert(Arc::clone(&core));
                core
            }
        };
        debug!(channel = %key, "channel retained");
        // Starts Active when messages are already pending.
        core.wake_up();
        Ok(Arc::new(LocalChannel {
            core,
            retained: Arc::clone(&self.retained),
        }))
    }

    async fn on_mark_channel_for_destroy(
        &self,
        _ctx: &ExecutionContext,
        key: ChannelKey,
    ) -> Result<(), BusError> {
        // Queues are kept for re-retention; nothing to reclaim here.
        debug!(channel = %key, "channel marked for destroy");
        Ok(())
    }

    async fn on_dispose(&self) -> Result<(), BusError> {
        let cores: Vec<Arc<ChannelCore>> = self
            .retained
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for core in &cores {
            core.stop();
        }
        self.retained.clear();
        debug!(channels = cores.len(), "local bus backend disposed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

struct ChannelCore {
    key: ChannelKey,
    queue: MessageQueue,
    handlers: HandlerSet,
    /// `Some` while Active.
    poller: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
    poll_interval: Duration,
    observer: Arc<dyn DeliveryObserver>,
    /// Cancelled on dispose; handed to handlers.
    ctx: ExecutionContext,
}

impl ChannelCore {
    fn new(
        key: ChannelKey,
        queue: MessageQueue,
        poll_interval: Duration,
        observer: Arc<dyn DeliveryObserver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            queue,
            handlers: HandlerSet::default(),
            poller: Mutex::new(None),
            disposed: AtomicBool::new(false),
            poll_interval,
            observer,
            ctx: ExecutionContext::with_correlation_id(key.to_string()),
        })
    }

    fn has_pending(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    /// Idle -> Active if messages are pending.
    fn wake_up(self: &Arc<Self>) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        let mut poller = self.poller.lock();
        if poller.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        if !self.has_pending() {
            return;
        }
        debug!(channel = %self.key, "channel active");
        *poller = Some(self.spawn_poller());
    }

    fn spawn_poller(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.poll_interval;
        let span = info_span!("channel", channel = %self.key);
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let Some(core) = weak.upgrade() else { break };
                    if !core.tick().await {
                        break;
                    }
                }
            }
            .instrument(span),
        )
    }

    /// Active -> Idle, unless there is still work to do. Runs under the
    /// poller lock so a concurrent `wake_up` cannot be lost.
    fn try_idle(&self) -> bool {
        let mut poller = self.poller.lock();
        if !self.disposed.load(Ordering::Acquire) && self.has_pending() && !self.handlers.is_empty()
        {
            return true;
        }
        *poller = None;
        debug!(channel = %self.key, "channel idle");
        false
    }

    /// One delivery attempt for the head message. Returns whether the
    /// poller should keep running.
    async fn tick(&self) -> bool {
        if self.disposed.load(Ordering::Acquire) {
            return false;
        }
        let head = self.queue.lock().front().cloned();
        let Some(message) = head else {
            return self.try_idle();
        };
        let handlers = self.handlers.snapshot();
        if handlers.is_empty() {
            return self.try_idle();
        }

        let event = ChannelEvent::new(self.key, Arc::clone(&message));
        let results = join_all(handlers.iter().map(|h| h.handle(&self.ctx, &event))).await;
        let errors: Vec<String> = results
            .into_iter()
            .filter_map(Result::err)
            .map(|e| format!("{e:#}"))
            .collect();

        let (status, evidence) = match (errors.is_empty(), event.mark()) {
            (true, DeliveryMark::Delivered(evidence)) => (DeliveryStatus::Success, evidence),
            (true, DeliveryMark::Pending) => (DeliveryStatus::Success, serde_json::Value::Null),
            (true, DeliveryMark::NotDelivered(evidence)) => (DeliveryStatus::Failure, evidence),
            (false, _) => (DeliveryStatus::Failure, json!({ "errors": errors })),
        };

        match status {
            DeliveryStatus::Success => {
                let mut queue = self.queue.lock();
                if queue.front().is_some_and(|m| Arc::ptr_eq(m, &message)) {
                    queue.pop_front();
                }
                debug!(message_id = %message.message_id, "message delivered");
            }
            DeliveryStatus::Failure => {
                warn!(
                    message_id = %message.message_id,
                    evidence = %evidence,
                    "delivery failed, will retry"
                );
            }
        }

        self.observer.on_delivery(&DeliveryData {
            egress_id: self.key.egress_id,
            topic_id: self.key.topic_id,
            message_id: message.message_id,
            status,
            evidence,
        });
        counter!("edgebus_delivery_total", "status" => status.as_str()).increment(1);
        true
    }

    /// Halts the poller. Safe while Active; an in-flight attempt is
    /// abandoned and its message stays queued.
    fn stop(&self) {
        self.disposed.store(true, Ordering::Release);
        self.ctx.cancel();
        if let Some(handle) = self.poller.lock().take() {
            handle.abort();
        }
    }
}

/// Handle returned by [`LocalBusBackend`] retains.
pub struct LocalChannel {
    core: Arc<ChannelCore>,
    retained: RetainedChannels,
}

#[async_trait]
impl Channel for LocalChannel {
    fn key(&self) -> ChannelKey {
        self.core.key
    }

    fn add_handler(&self, handler: Arc<dyn ChannelHandler>) {
        self.core.handlers.add(handler);
        self.core.wake_up();
    }

    fn remove_handler(&self, handler: &Arc<dyn ChannelHandler>) -> bool {
        self.core.handlers.remove(handler)
    }

    fn wake_up(&self) {
        self.core.wake_up();
    }

    async fn dispose(&self) {
        self.core.stop();
        let core = &self.core;
        self.retained.remove_if(&core.key, |_, v| Arc::ptr_eq(v, core));
        debug!(channel = %core.key, "channel disposed");
    }
}
