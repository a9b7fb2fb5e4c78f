//! In-memory [`DatabaseFactory`] with real commit/rollback semantics.
//!
//! Each transaction holds the store's lock for its whole lifetime, reads the
//! committed state in place and records its writes in a journal. `commit`
//! applies the journal; `rollback` (or drop) discards it. Transactions are
//! fully serialized and their cost depends only on what they write.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use edgebus_core::{
    Delivery, DeliveryData, DeliveryId, Egress, EgressId, Ingress, IngressId, Label, LabelHandler,
    LabelId, Message, MessageId, Topic, TopicId,
};
use serde::Deserialize;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::StorageError;
use crate::context::ExecutionContext;
use crate::traits::{Database, DatabaseFactory, TopicLookup};

/// Initial records loaded into an [`InMemoryDatabaseFactory`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemorySeed {
    pub topics: Vec<Topic>,
    pub ingresses: Vec<Ingress>,
    pub egresses: Vec<Egress>,
    pub label_handlers: Vec<LabelHandler>,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    topics: HashMap<TopicId, Topic>,
    ingresses: HashMap<IngressId, Ingress>,
    egresses: HashMap<EgressId, Egress>,
    label_handlers: Vec<LabelHandler>,
    labels: HashMap<String, Label>,
    messages: HashMap<MessageId, Message>,
    deliveries: Vec<Delivery>,
}

/// In-memory storage backend.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabaseFactory {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryDatabaseFactory {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with metadata records.
    #[must_use]
    pub fn from_seed(seed: MemorySeed) -> Self {
        let state = MemoryState {
            topics: seed.topics.into_iter().map(|t| (t.topic_id, t)).collect(),
            ingresses: seed
                .ingresses
                .into_iter()
                .map(|i| (i.ingress_id, i))
                .collect(),
            egresses: seed
                .egresses
                .into_iter()
                .map(|e| (e.egress_id, e))
                .collect(),
            label_handlers: seed.label_handlers,
            ..MemoryState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// All labels ever created, sorted by value.
    pub async fn labels(&self) -> Vec<Label> {
        let mut labels: Vec<Label> = self.state.lock().await.labels.values().cloned().collect();
        labels.sort_by(|a, b| a.label_value.cmp(&b.label_value));
        labels
    }

    /// Number of persisted messages.
    pub async fn message_count(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    pub async fn message(&self, message_id: MessageId) -> Option<Message> {
        self.state.lock().await.messages.get(&message_id).cloned()
    }

    /// Delivery audit records in append order.
    pub async fn deliveries(&self) -> Vec<Delivery> {
        self.state.lock().await.deliveries.clone()
    }
}

impl InMemoryDatabaseFactory {
    async fn open(&self, ctx: &ExecutionContext) -> Result<InMemoryDatabase, StorageError> {
        let committed = tokio::select! {
            guard = Arc::clone(&self.state).lock_owned() => guard,
            () = ctx.cancelled() => return Err(StorageError::Cancelled),
        };
        Ok(InMemoryDatabase {
            committed,
            journal: Journal::default(),
        })
    }
}

#[async_trait]
impl DatabaseFactory for InMemoryDatabaseFactory {
    async fn begin(&self, ctx: &ExecutionContext) -> anyhow::Result<Box<dyn Database>> {
        Ok(Box::new(self.open(ctx).await?))
    }
}

/// Writes of one open transaction.
#[derive(Debug, Default)]
struct Journal {
    labels: HashMap<String, Label>,
    messages: HashMap<MessageId, Message>,
    deliveries: Vec<Delivery>,
}

impl Journal {
    fn len(&self) -> usize {
        self.labels.len() + self.messages.len() + self.deliveries.len()
    }
}

struct InMemoryDatabase {
    committed: OwnedMutexGuard<MemoryState>,
    journal: Journal,
}

impl InMemoryDatabase {
    fn label(&self, value: &str) -> Option<&Label> {
        self.journal
            .labels
            .get(value)
            .or_else(|| self.committed.labels.get(value))
    }

    fn has_message(&self, message_id: MessageId) -> bool {
        self.journal.messages.contains_key(&message_id)
            || self.committed.messages.contains_key(&message_id)
    }
}

fn not_found(entity: &'static str, id: impl ToString) -> anyhow::Error {
    StorageError::NotFound {
        entity,
        id: id.to_string(),
    }
    .into()
}

#[async_trait]
impl Database for InMemoryDatabase {
    async fn list_label_handlers(
        &mut self,
        _ctx: &ExecutionContext,
        topic_id: Option<TopicId>,
    ) -> anyhow::Result<Vec<LabelHandler>> {
        Ok(self
            .committed
            .label_handlers
            .iter()
            .filter(|h| topic_id.is_none_or(|id| h.topic_id == id))
            .cloned()
            .collect())
    }

    async fn list_topics(&mut self, _ctx: &ExecutionContext) -> anyhow::Result<Vec<Topic>> {
        let mut topics: Vec<Topic> = self.committed.topics.values().cloned().collect();
        topics.sort_by(|a, b| a.topic_name.cmp(&b.topic_name));
        Ok(topics)
    }

    async fn list_egresses(&mut self, _ctx: &ExecutionContext) -> anyhow::Result<Vec<Egress>> {
        let mut egresses: Vec<Egress> = self.committed.egresses.values().cloned().collect();
        egresses.sort_by_key(|e| e.egress_id);
        Ok(egresses)
    }

    async fn get_topic(
        &mut self,
        _ctx: &ExecutionContext,
        lookup: TopicLookup,
    ) -> anyhow::Result<Topic> {
        let topic_id = match lookup {
            TopicLookup::ById(topic_id) => topic_id,
            TopicLookup::ByIngress(ingress_id) => {
                self.committed
                    .ingresses
                    .get(&ingress_id)
                    .ok_or_else(|| not_found("ingress", ingress_id))?
                    .topic_id
            }
        };
        self.committed
            .topics
            .get(&topic_id)
            .cloned()
            .ok_or_else(|| not_found("topic", topic_id))
    }

    async fn get_ingress(
        &mut self,
        _ctx: &ExecutionContext,
        ingress_id: IngressId,
    ) -> anyhow::Result<Ingress> {
        self.committed
            .ingresses
            .get(&ingress_id)
            .cloned()
            .ok_or_else(|| not_found("ingress", ingress_id))
    }

    async fn get_egress(
        &mut self,
        _ctx: &ExecutionContext,
        egress_id: EgressId,
    ) -> anyhow::Result<Egress> {
        self.committed
            .egresses
            .get(&egress_id)
            .cloned()
            .ok_or_else(|| not_found("egress", egress_id))
    }

    async fn find_label_by_value(
        &mut self,
        _ctx: &ExecutionContext,
        value: &str,
    ) -> anyhow::Result<Option<Label>> {
        Ok(self.label(value).cloned())
    }

    async fn create_label(&mut self, _ctx: &ExecutionContext, value: &str) -> anyhow::Result<Label> {
        if self.label(value).is_some() {
            return Err(StorageError::Conflict {
                entity: "label",
                id: value.to_string(),
            }
            .into());
        }
        let label = Label {
            label_id: LabelId::generate(),
            label_value: value.to_string(),
        };
        self.journal
            .labels
            .insert(value.to_string(), label.clone());
        Ok(label)
    }

    async fn create_message(
        &mut self,
        _ctx: &ExecutionContext,
        ingress_id: IngressId,
        message_id: MessageId,
        headers: BTreeMap<String, String>,
        media_type: String,
        ingress_body: Bytes,
        transformed_body: Bytes,
        labels: Vec<Label>,
    ) -> anyhow::Result<Message> {
        if self.has_message(message_id) {
            return Err(StorageError::Conflict {
                entity: "message",
                id: message_id.to_string(),
            }
            .into());
        }
        let message = Message {
            message_id,
            ingress_id,
            headers,
            media_type,
            ingress_body,
            transformed_body,
            labels,
        };
        self.journal.messages.insert(message_id, message.clone());
        Ok(message)
    }

    async fn create_delivery(
        &mut self,
        _ctx: &ExecutionContext,
        data: DeliveryData,
    ) -> anyhow::Result<Delivery> {
        let delivery = Delivery {
            delivery_id: DeliveryId::generate(),
            data,
            created_at: Utc::now(),
        };
        self.journal.deliveries.push(delivery.clone());
        Ok(delivery)
    }

    async fn commit(self: Box<Self>) -> anyhow::Result<()> {
        let Self {
            mut committed,
            journal,
        } = *self;
        committed.labels.extend(journal.labels);
        committed.messages.extend(journal.messages);
        committed.deliveries.extend(journal.deliveries);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> anyhow::Result<()> {
        Ok(())
    }
}
