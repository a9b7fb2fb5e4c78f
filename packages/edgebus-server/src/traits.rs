use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use edgebus_core::{
    Delivery, DeliveryData, Egress, EgressId, Ingress, IngressId, Label, LabelHandler, Message,
    MessageId, Topic, TopicId,
};

use crate::context::ExecutionContext;

/// How a topic is located: directly, or through an ingress bound to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicLookup {
    ById(TopicId),
    ByIngress(IngressId),
}

/// Pluggable persistence backend: opens scoped units of work.
///
/// The storage engine's schema and durability model live behind this trait.
/// Implementations: in-memory (tests, launcher); SQL backends plug in here.
#[async_trait]
pub trait DatabaseFactory: Send + Sync {
    /// Begins a transaction. Dropping the returned unit of work without
    /// calling [`Database::commit`] discards its changes.
    async fn begin(&self, ctx: &ExecutionContext) -> anyhow::Result<Box<dyn Database>>;
}

/// One transactional unit of work over bus metadata and messages.
///
/// Lookups fail with [`StorageError::NotFound`](crate::storage::StorageError)
/// when the record does not exist.
#[async_trait]
pub trait Database: Send {
    /// Lists label handlers, optionally restricted to one topic.
    async fn list_label_handlers(
        &mut self,
        ctx: &ExecutionContext,
        topic_id: Option<TopicId>,
    ) -> anyhow::Result<Vec<LabelHandler>>;

    async fn list_topics(&mut self, ctx: &ExecutionContext) -> anyhow::Result<Vec<Topic>>;

    async fn list_egresses(&mut self, ctx: &ExecutionContext) -> anyhow::Result<Vec<Egress>>;

    async fn get_topic(&mut self, ctx: &ExecutionContext, lookup: TopicLookup)
        -> anyhow::Result<Topic>;

    async fn get_ingress(
        &mut self,
        ctx: &ExecutionContext,
        ingress_id: IngressId,
    ) -> anyhow::Result<Ingress>;

    async fn get_egress(
        &mut self,
        ctx: &ExecutionContext,
        egress_id: EgressId,
    ) -> anyhow::Result<Egress>;

    /// Looks up a label by its value. Returns `None` if never observed.
    async fn find_label_by_value(
        &mut self,
        ctx: &ExecutionContext,
        value: &str,
    ) -> anyhow::Result<Option<Label>>;

    async fn create_label(&mut self, ctx: &ExecutionContext, value: &str)
        -> anyhow::Result<Label>;

    /// Persists a message with its final label set.
    #[allow(clippy::too_many_arguments)]
    async fn create_message(
        &mut self,
        ctx: &ExecutionContext,
        ingress_id: IngressId,
        message_id: MessageId,
        headers: BTreeMap<String, String>,
        media_type: String,
        ingress_body: Bytes,
        transformed_body: Bytes,
        labels: Vec<Label>,
    ) -> anyhow::Result<Message>;

    /// Appends a delivery audit record.
    async fn create_delivery(
        &mut self,
        ctx: &ExecutionContext,
        data: DeliveryData,
    ) -> anyhow::Result<Delivery>;

    /// Makes every change of this unit of work visible.
    async fn commit(self: Box<Self>) -> anyhow::Result<()>;

    /// Discards every change of this unit of work.
    async fn rollback(self: Box<Self>) -> anyhow::Result<()>;
}
