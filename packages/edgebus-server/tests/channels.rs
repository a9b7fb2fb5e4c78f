//! Channel retention and at-least-once delivery through the bus.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{eventually, ingress, label_config, raw_message, topic, websocket_host, TICK};
use edgebus_core::{DeliveryStatus, MessageId};
use edgebus_server::bus::{
    Channel, ChannelEvent, ChannelHandler, CompositeDeliveryObserver, DeliveryObserver,
    DeliveryRecorder, LocalBusBackend, MessageBus,
};
use edgebus_server::error::BusError;
use edgebus_server::storage::{InMemoryDatabaseFactory, MemorySeed};
use edgebus_server::ExecutionContext;
use parking_lot::Mutex;
use serde_json::json;

struct Fixture {
    storage: InMemoryDatabaseFactory,
    bus: Arc<MessageBus>,
    recorder: Arc<DeliveryRecorder>,
    topic_id: edgebus_core::TopicId,
    egress_id: edgebus_core::EgressId,
    ingress_id: edgebus_core::IngressId,
}

async fn fixture() -> Fixture {
    let topic = topic("ORDERS");
    let ingress = ingress(&topic);
    let egress = websocket_host(&topic);
    let (topic_id, egress_id, ingress_id) = (topic.topic_id, egress.egress_id, ingress.ingress_id);
    let storage = InMemoryDatabaseFactory::from_seed(MemorySeed {
        topics: vec![topic],
        ingresses: vec![ingress],
        egresses: vec![egress],
        label_handlers: Vec::new(),
    });

    let recorder = Arc::new(DeliveryRecorder::start(Arc::new(storage.clone()), 64));
    let observer = CompositeDeliveryObserver::new(vec![
        Arc::clone(&recorder) as Arc<dyn DeliveryObserver>
    ]);
    let backend = LocalBusBackend::new(TICK, Arc::new(observer));
    let bus = Arc::new(MessageBus::new(
        Arc::new(storage.clone()),
        Arc::new(backend),
        label_config(),
    ));
    let ctx = ExecutionContext::new();
    bus.init(&ctx).await.unwrap();
    bus.register_topic(&ctx, topic_id).await.unwrap();
    bus.register_egress(&ctx, egress_id).await.unwrap();

    Fixture {
        storage,
        bus,
        recorder,
        topic_id,
        egress_id,
        ingress_id,
    }
}

/// Fails the first `failures` attempts, then succeeds.
struct Flaky {
    failures: usize,
    attempts: AtomicUsize,
    delivered: Mutex<Vec<MessageId>>,
}

impl Flaky {
    fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures,
            attempts: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ChannelHandler for Flaky {
    async fn handle(&self, _ctx: &ExecutionContext, event: &ChannelEvent) -> anyhow::Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            anyhow::bail!("target unavailable (attempt {attempt})");
        }
        self.delivered.lock().push(event.message().message_id);
        event.mark_delivered(json!({ "attempt": attempt }));
        Ok(())
    }
}

async fn retain(f: &Fixture) -> Result<Arc<dyn Channel>, BusError> {
    f.bus
        .retain_channel(&ExecutionContext::new(), f.topic_id, f.egress_id)
        .await
}

#[tokio::test]
async fn channel_is_retained_exclusively_until_disposed() {
    let f = fixture().await;

    let channel = retain(&f).await.unwrap();
    match retain(&f).await {
        Err(BusError::InvalidOperation(message)) => {
            assert!(message.contains("cannot retain channel twice"));
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("second retain succeeded"),
    }

    channel.dispose().await;
    let again = retain(&f).await.unwrap();
    again.dispose().await;
}

#[tokio::test]
async fn retain_of_unknown_egress_fails() {
    let f = fixture().await;
    let result = f
        .bus
        .retain_channel(
            &ExecutionContext::new(),
            f.topic_id,
            edgebus_core::EgressId::generate(),
        )
        .await;
    assert!(matches!(result, Err(BusError::Storage(_))));
}

#[tokio::test]
async fn throwing_handler_is_retried_until_success() {
    let f = fixture().await;
    let ctx = ExecutionContext::new();

    let channel = f
        .bus
        .channel_factory(f.topic_id, f.egress_id)
        .create_channel(&ctx)
        .await
        .unwrap();
    let flaky = Flaky::new(2);
    channel.add_handler(Arc::clone(&flaky) as Arc<dyn ChannelHandler>);

    let message = f
        .bus
        .publish(&ctx, f.ingress_id, raw_message("{}"))
        .await
        .unwrap();

    let delivered = eventually(Duration::from_secs(5), || {
        let flaky = Arc::clone(&flaky);
        async move { !flaky.delivered.lock().is_empty() }
    })
    .await;
    assert!(delivered);
    assert_eq!(*flaky.delivered.lock(), vec![message.message_id]);
    assert_eq!(flaky.attempts.load(Ordering::SeqCst), 3);

    channel.dispose().await;
    f.recorder.stop().await;

    let statuses: Vec<DeliveryStatus> = f
        .storage
        .deliveries()
        .await
        .into_iter()
        .map(|d| d.data.status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            DeliveryStatus::Failure,
            DeliveryStatus::Failure,
            DeliveryStatus::Success
        ]
    );
}

#[tokio::test]
async fn messages_published_before_retain_are_delivered() {
    let f = fixture().await;
    let ctx = ExecutionContext::new();

    let first = f.bus.publish(&ctx, f.ingress_id, raw_message("1")).await.unwrap();
    let second = f.bus.publish(&ctx, f.ingress_id, raw_message("2")).await.unwrap();

    let channel = retain(&f).await.unwrap();
    let handler = Flaky::new(0);
    channel.add_handler(Arc::clone(&handler) as Arc<dyn ChannelHandler>);

    let done = eventually(Duration::from_secs(5), || {
        let handler = Arc::clone(&handler);
        async move { handler.delivered.lock().len() == 2 }
    })
    .await;
    assert!(done);
    assert_eq!(
        *handler.delivered.lock(),
        vec![first.message_id, second.message_id]
    );
    channel.dispose().await;
}

#[tokio::test]
async fn queue_survives_dispose_and_mark_for_destroy() {
    let f = fixture().await;
    let ctx = ExecutionContext::new();

    let channel = retain(&f).await.unwrap();
    f.bus
        .mark_channel_for_destroy(&ctx, f.topic_id, f.egress_id)
        .await
        .unwrap();
    channel.dispose().await;

    let message = f.bus.publish(&ctx, f.ingress_id, raw_message("{}")).await.unwrap();

    let channel = retain(&f).await.unwrap();
    let handler = Flaky::new(0);
    channel.add_handler(Arc::clone(&handler) as Arc<dyn ChannelHandler>);
    let done = eventually(Duration::from_secs(5), || {
        let handler = Arc::clone(&handler);
        async move { !handler.delivered.lock().is_empty() }
    })
    .await;
    assert!(done);
    assert_eq!(*handler.delivered.lock(), vec![message.message_id]);

    f.bus.dispose().await.unwrap();
    assert!(retain(&f).await.is_ok());
}
