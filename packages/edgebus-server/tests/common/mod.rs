//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use edgebus_core::{
    DeliveryEnvelope, Egress, EgressDelivery, EgressId, Ingress, IngressId, LabelHandler,
    LabelHandlerId, LabelHandlerKind, MessageData, MessageId, Topic, TopicId,
};
use edgebus_server::bus::{CompositeDeliveryObserver, LocalBusBackend, MessageBus};
use edgebus_server::config::{EdgebusConfig, ExternalProcessConfig};
use edgebus_server::egress::EndpointRegistry;
use edgebus_server::storage::{InMemoryDatabaseFactory, MemorySeed};
use edgebus_server::{Edgebus, ExecutionContext};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const TICK: Duration = Duration::from_millis(10);

pub fn topic(name: &str) -> Topic {
    Topic {
        topic_id: TopicId::generate(),
        topic_name: name.to_string(),
        domain: None,
        description: format!("{name} events"),
        media_type: "application/json".to_string(),
    }
}

pub fn ingress(topic: &Topic) -> Ingress {
    Ingress {
        ingress_id: IngressId::generate(),
        topic_id: topic.topic_id,
    }
}

pub fn webhook(topic: &Topic, url: String, method: Option<&str>) -> Egress {
    Egress {
        egress_id: EgressId::generate(),
        source_topic_ids: vec![topic.topic_id],
        delivery: EgressDelivery::Webhook {
            url,
            method: method.map(str::to_string),
        },
    }
}

pub fn websocket_host(topic: &Topic) -> Egress {
    Egress {
        egress_id: EgressId::generate(),
        source_topic_ids: vec![topic.topic_id],
        delivery: EgressDelivery::WebSocketHost,
    }
}

pub fn label_handler(topic: &Topic, path: &str) -> LabelHandler {
    LabelHandler {
        label_handler_id: LabelHandlerId::generate(),
        topic_id: topic.topic_id,
        kind: LabelHandlerKind::ExternalProcess {
            external_process_path: path.to_string(),
        },
    }
}

/// A message whose transformed body is `body` verbatim.
pub fn raw_message(body: &'static str) -> MessageData {
    MessageData {
        message_id: MessageId::generate(),
        headers: BTreeMap::new(),
        media_type: "application/json".to_string(),
        ingress_body: Bytes::from_static(body.as_bytes()),
        transformed_body: Bytes::from_static(body.as_bytes()),
    }
}

/// A message carrying a delivery envelope.
pub fn envelope_message(envelope: &DeliveryEnvelope) -> MessageData {
    let transformed = serde_json::to_vec(envelope).unwrap();
    MessageData {
        message_id: MessageId::generate(),
        headers: envelope.headers.clone(),
        media_type: "application/json".to_string(),
        ingress_body: Bytes::from(serde_json::to_vec(&envelope.body).unwrap()),
        transformed_body: Bytes::from(transformed),
    }
}

pub fn label_config() -> ExternalProcessConfig {
    ExternalProcessConfig {
        spawn_timeout: Duration::from_secs(5),
        execution_timeout: Duration::from_secs(5),
        handlers_dir: PathBuf::from("/"),
    }
}

/// A bus over `storage` with a fast local backend, already initialized.
pub async fn bus(storage: &InMemoryDatabaseFactory) -> Arc<MessageBus> {
    let backend = LocalBusBackend::new(TICK, Arc::new(CompositeDeliveryObserver::default()));
    let bus = Arc::new(MessageBus::new(
        Arc::new(storage.clone()),
        Arc::new(backend),
        label_config(),
    ));
    bus.init(&ExecutionContext::new()).await.unwrap();
    bus
}

/// Polls `check` until it holds or `timeout` expires.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(TICK).await;
    }
}

/// A running server on `127.0.0.1`.
pub struct TestServer {
    pub port: u16,
    pub bus: Arc<MessageBus>,
    pub endpoints: Arc<EndpointRegistry>,
    pub storage: InMemoryDatabaseFactory,
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<anyhow::Result<()>>>,
}

impl TestServer {
    pub async fn start(seed: MemorySeed) -> Self {
        let storage = InMemoryDatabaseFactory::from_seed(seed);

        let mut config = EdgebusConfig::default();
        config.network.host = "127.0.0.1".to_string();
        config.network.port = 0;
        config.bus.poll_interval = TICK;
        config.labels = label_config();

        let mut edgebus = Edgebus::build(config, Arc::new(storage.clone()))
            .await
            .unwrap();
        let port = edgebus.start().await.unwrap();
        let bus = edgebus.bus();
        let endpoints = edgebus.endpoints();

        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(edgebus.run(async move {
            let _ = stopped.await;
        }));

        let server = Self {
            port,
            bus,
            endpoints,
            storage,
            stop: Some(stop),
            handle: Some(handle),
        };
        let ready_url = server.url("/health/ready");
        let ready = eventually(Duration::from_secs(5), || {
            let url = ready_url.clone();
            async move {
                reqwest::get(&url)
                    .await
                    .is_ok_and(|r| r.status() == reqwest::StatusCode::OK)
            }
        })
        .await;
        assert!(ready, "server did not become ready");
        server
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://127.0.0.1:{}{path}", self.port)
    }

    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.await.unwrap().unwrap();
        }
    }
}
