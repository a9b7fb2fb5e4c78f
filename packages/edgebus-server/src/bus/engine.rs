//! Message bus engine: publish pipeline, registration, channel retention.
//!
//! The engine owns the storage-facing half of every operation and delegates
//! fan-out and channel bookkeeping to a [`BusBackend`]. Every storage access
//! runs inside one unit of work that is committed on success and rolled back
//! on any error.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use edgebus_core::{Egress, EgressId, Ingress, IngressId, Label, Message, MessageData, Topic, TopicId};
use futures_util::future::join_all;
use metrics::counter;
use tracing::{debug, info, info_span, Instrument};

use super::channel::{Channel, ChannelFactory, ChannelKey};
use crate::context::ExecutionContext;
use crate::error::{AggregateError, BusError};
use crate::labels::{build_labels_handler, ExternalProcessConfig, LabelsHandler};
use crate::service::registry::ManagedComponent;
use crate::storage;
use crate::traits::{Database, DatabaseFactory, TopicLookup};

type HandlerTable = HashMap<TopicId, Vec<Arc<dyn LabelsHandler>>>;

/// Fan-out and channel bookkeeping behind the engine.
///
/// The engine calls these hooks after loading the relevant records; the
/// publish hook runs inside the publish transaction.
#[async_trait]
pub trait BusBackend: Send + Sync {
    /// Appends the persisted message to every channel bound to `topic` and
    /// wakes the retained ones.
    async fn on_publish(
        &self,
        ctx: &ExecutionContext,
        ingress: &Ingress,
        topic: &Topic,
        message: Arc<Message>,
    ) -> Result<(), BusError>;

    async fn on_register_topic(&self, ctx: &ExecutionContext, topic: &Topic)
        -> Result<(), BusError>;

    async fn on_register_egress(
        &self,
        ctx: &ExecutionContext,
        egress: &Egress,
    ) -> Result<(), BusError>;

    /// Retains the channel of (`topic`, `egress`).
    ///
    /// Implementations must fail with [`BusError::InvalidOperation`] while
    /// the same pair is still retained.
    async fn on_retain_channel(
        &self,
        ctx: &ExecutionContext,
        topic: &Topic,
        egress: &Egress,
    ) -> Result<Arc<dyn Channel>, BusError>;

    async fn on_mark_channel_for_destroy(
        &self,
        ctx: &ExecutionContext,
        key: ChannelKey,
    ) -> Result<(), BusError>;

    /// Disposes every retained channel.
    async fn on_dispose(&self) -> Result<(), BusError>;
}

/// The message bus.
pub struct MessageBus {
    storage: Arc<dyn DatabaseFactory>,
    backend: Arc<dyn BusBackend>,
    label_config: ExternalProcessConfig,
    label_handlers: ArcSwap<HandlerTable>,
}

impl MessageBus {
    #[must_use]
    pub fn new(
        storage: Arc<dyn DatabaseFactory>,
        backend: Arc<dyn BusBackend>,
        label_config: ExternalProcessConfig,
    ) -> Self {
        Self {
            storage,
            backend,
            label_config,
            label_handlers: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Loads every stored label handler and builds the per-topic table.
    ///
    /// # Errors
    ///
    /// Fails on storage errors or on a handler kind that cannot be run.
    pub async fn init(&self, ctx: &ExecutionContext) -> Result<(), BusError> {
        let mut db = self.storage.begin(ctx).await?;
        let result = self.load_label_handlers(ctx, db.as_mut()).await;
        let table = storage::finish(db, result).await?;

        let count: usize = table.values().map(Vec::len).sum();
        info!(handlers = count, topics = table.len(), "label handlers loaded");
        self.label_handlers.store(Arc::new(table));
        Ok(())
    }

    async fn load_label_handlers(
        &self,
        ctx: &ExecutionContext,
        db: &mut dyn Database,
    ) -> Result<HandlerTable, BusError> {
        let mut table = HandlerTable::new();
        for record in db.list_label_handlers(ctx, None).await? {
            let handler = build_labels_handler(&record, &self.label_config)?;
            table.entry(record.topic_id).or_default().push(handler);
        }
        Ok(table)
    }

    /// Adds a label handler at runtime. Call after [`init`](Self::init),
    /// which replaces the whole table.
    pub fn register_labels_handler(&self, handler: Arc<dyn LabelsHandler>) {
        self.label_handlers.rcu(|table| {
            let mut table = HandlerTable::clone(table);
            table
                .entry(handler.topic_id())
                .or_default()
                .push(Arc::clone(&handler));
            table
        });
    }

    /// Publishes a message received by `ingress_id`.
    ///
    /// Label handlers of the ingress's topic run concurrently; their values
    /// are deduplicated and resolved to labels. If any handler fails nothing
    /// is persisted and every failure is reported in one
    /// [`BusError::Aggregate`].
    ///
    /// # Errors
    ///
    /// Storage failures, label handler failures, or cancellation.
    pub async fn publish(
        &self,
        ctx: &ExecutionContext,
        ingress_id: IngressId,
        data: MessageData,
    ) -> Result<Arc<Message>, BusError> {
        let span = info_span!(
            "publish",
            ingress_id = %ingress_id,
            message_id = %data.message_id,
            correlation_id = ctx.correlation_id(),
        );
        self.publish_tx(ctx, ingress_id, data).instrument(span).await
    }

    async fn publish_tx(
        &self,
        ctx: &ExecutionContext,
        ingress_id: IngressId,
        data: MessageData,
    ) -> Result<Arc<Message>, BusError> {
        if ctx.is_cancelled() {
            return Err(BusError::Cancelled);
        }
        let mut db = self.storage.begin(ctx).await?;
        let result = self.publish_in(ctx, db.as_mut(), ingress_id, data).await;
        let result = storage::finish(db, result).await;

        let outcome = if result.is_ok() { "success" } else { "failure" };
        counter!("edgebus_publish_total", "outcome" => outcome).increment(1);
        match &result {
            Ok(message) => debug!(labels = message.labels.len(), "message published"),
            Err(e) => info!(error = %e, "publish failed"),
        }
        result
    }

    async fn publish_in(
        &self,
        ctx: &ExecutionContext,
        db: &mut dyn Database,
        ingress_id: IngressId,
        data: MessageData,
    ) -> Result<Arc<Message>, BusError> {
        let topic = db.get_topic(ctx, TopicLookup::ByIngress(ingress_id)).await?;
        let ingress = db.get_ingress(ctx, ingress_id).await?;

        let values = self.resolve_label_values(ctx, topic.topic_id, &data).await?;

        let mut labels: Vec<Label> = Vec::with_capacity(values.len());
        for value in &values {
            let label = match db.find_label_by_value(ctx, value).await? {
                Some(label) => label,
                None => db.create_label(ctx, value).await?,
            };
            labels.push(label);
        }

        let MessageData {
            message_id,
            headers,
            media_type,
            ingress_body,
            transformed_body,
        } = data;
        let message = db
            .create_message(
                ctx,
                ingress_id,
                message_id,
                headers,
                media_type,
                ingress_body,
                transformed_body,
                labels,
            )
            .await?;
        let message = Arc::new(message);

        self.backend
            .on_publish(ctx, &ingress, &topic, Arc::clone(&message))
            .await?;
        Ok(message)
    }

    async fn resolve_label_values(
        &self,
        ctx: &ExecutionContext,
        topic_id: TopicId,
        data: &MessageData,
    ) -> Result<BTreeSet<String>, BusError> {
        let table = self.label_handlers.load_full();
        let Some(handlers) = table.get(&topic_id) else {
            return Ok(BTreeSet::new());
        };

        let results = join_all(handlers.iter().map(|h| h.execute(ctx, data))).await;

        let mut values = BTreeSet::new();
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(resolved) => values.extend(resolved),
                Err(e) => failures.push(e),
            }
        }
        if !failures.is_empty() {
            return Err(AggregateError { failures }.into());
        }
        Ok(values)
    }

    /// Loads the topic and hands it to the backend.
    ///
    /// # Errors
    ///
    /// Storage failures (including an unknown topic).
    pub async fn register_topic(
        &self,
        ctx: &ExecutionContext,
        topic_id: TopicId,
    ) -> Result<(), BusError> {
        let mut db = self.storage.begin(ctx).await?;
        let result = async {
            let topic = db.get_topic(ctx, TopicLookup::ById(topic_id)).await?;
            self.backend.on_register_topic(ctx, &topic).await?;
            debug!(topic = %topic.topic_name, "topic registered");
            Ok::<_, BusError>(())
        }
        .await;
        storage::finish(db, result).await
    }

    /// Loads the egress and hands it to the backend.
    ///
    /// # Errors
    ///
    /// Storage failures (including an unknown egress).
    pub async fn register_egress(
        &self,
        ctx: &ExecutionContext,
        egress_id: EgressId,
    ) -> Result<(), BusError> {
        let mut db = self.storage.begin(ctx).await?;
        let result = async {
            let egress = db.get_egress(ctx, egress_id).await?;
            self.backend.on_register_egress(ctx, &egress).await?;
            debug!(egress_id = %egress_id, "egress registered");
            Ok::<_, BusError>(())
        }
        .await;
        storage::finish(db, result).await
    }

    /// Retains the channel delivering `topic_id` to `egress_id`.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidOperation`] if the pair is already retained, or a
    /// storage failure.
    pub async fn retain_channel(
        &self,
        ctx: &ExecutionContext,
        topic_id: TopicId,
        egress_id: EgressId,
    ) -> Result<Arc<dyn Channel>, BusError> {
        let mut db = self.storage.begin(ctx).await?;
        let result = async {
            let topic = db.get_topic(ctx, TopicLookup::ById(topic_id)).await?;
            let egress = db.get_egress(ctx, egress_id).await?;
            self.backend.on_retain_channel(ctx, &topic, &egress).await
        }
        .await;
        storage::finish(db, result).await
    }

    /// Signals that the subscriber intends to release its channel.
    ///
    /// # Errors
    ///
    /// Whatever the backend reports.
    pub async fn mark_channel_for_destroy(
        &self,
        ctx: &ExecutionContext,
        topic_id: TopicId,
        subscriber_id: EgressId,
    ) -> Result<(), BusError> {
        self.backend
            .on_mark_channel_for_destroy(ctx, ChannelKey::new(topic_id, subscriber_id))
            .await
    }

    /// Disposes every channel still retained through this bus.
    ///
    /// # Errors
    ///
    /// Whatever the backend reports.
    pub async fn dispose(&self) -> Result<(), BusError> {
        self.backend.on_dispose().await
    }

    /// Returns a deferred retain of (`topic_id`, `egress_id`) for an egress
    /// adapter.
    #[must_use]
    pub fn channel_factory(
        self: &Arc<Self>,
        topic_id: TopicId,
        egress_id: EgressId,
    ) -> Arc<dyn ChannelFactory> {
        Arc::new(BusChannelFactory {
            bus: Arc::clone(self),
            key: ChannelKey::new(topic_id, egress_id),
        })
    }
}

struct BusChannelFactory {
    bus: Arc<MessageBus>,
    key: ChannelKey,
}

#[async_trait]
impl ChannelFactory for BusChannelFactory {
    fn key(&self) -> ChannelKey {
        self.key
    }

    async fn create_channel(&self, ctx: &ExecutionContext) -> Result<Arc<dyn Channel>, BusError> {
        self.bus
            .retain_channel(ctx, self.key.topic_id, self.key.egress_id)
            .await
    }
}

#[async_trait]
impl ManagedComponent for MessageBus {
    fn name(&self) -> &str {
        "message-bus"
    }

    async fn init(&self, ctx: &ExecutionContext) -> anyhow::Result<()> {
        MessageBus::init(self, ctx).await?;
        Ok(())
    }

    async fn dispose(&self) -> anyhow::Result<()> {
        MessageBus::dispose(self).await?;
        Ok(())
    }
}
