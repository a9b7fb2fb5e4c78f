//! WebSocket host egress: pushes channel events to connected consumers.
//!
//! One endpoint multiplexes the channels of every source topic. Handlers are
//! attached only while at least one consumer is connected, so messages stay
//! queued in the channels while nobody listens.

use std::sync::Arc;

use async_trait::async_trait;
use edgebus_core::{Egress, EgressId, EgressKind, Message};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use super::endpoint::{ConsumerTransition, EndpointRegistry, WebSocketHostEndpoint};
use super::TopicBinding;
use crate::bus::{Channel, ChannelEvent, ChannelHandler};
use crate::config::{ConnectionConfig, WebSocketHostConfig};
use crate::context::ExecutionContext;
use crate::error::BusError;
use crate::service::registry::ManagedComponent;

/// Builds the JSON-RPC 2.0 notification sent to consumers for one message.
///
/// The transformed body is embedded as JSON when it parses, otherwise as a
/// string.
#[must_use]
pub fn message_frame(topic_name: &str, message: &Message) -> Value {
    let body = serde_json::from_slice::<Value>(&message.transformed_body).unwrap_or_else(|_| {
        Value::String(String::from_utf8_lossy(&message.transformed_body).into_owned())
    });
    json!({
        "jsonrpc": "2.0",
        "method": "message",
        "params": {
            "topic": topic_name,
            "messageId": message.message_id,
            "mediaType": message.media_type,
            "labels": message.label_values().collect::<Vec<_>>(),
            "body": body,
        }
    })
}

/// Channel handler pushing one topic's events to the endpoint's consumers.
struct PushHandler {
    topic_name: String,
    endpoint: Arc<WebSocketHostEndpoint>,
}

#[async_trait]
impl ChannelHandler for PushHandler {
    async fn handle(&self, _ctx: &ExecutionContext, event: &ChannelEvent) -> anyhow::Result<()> {
        let consumers = self.endpoint.consumer_count();
        if consumers == 0 {
            event.mark_not_delivered(json!({ "reason": "no consumers" }));
            return Ok(());
        }

        let frame = message_frame(&self.topic_name, event.message()).to_string();
        let accepted = self.endpoint.broadcast(&frame).await;
        if accepted > 0 {
            event.mark_delivered(json!({ "consumers": accepted }));
        } else {
            debug!(key = %event.key(), consumers, "no consumer accepted the frame");
            event.mark_not_delivered(json!({
                "reason": "no consumer accepted the frame",
                "consumers": consumers,
            }));
        }
        Ok(())
    }
}

type Bound = Arc<Vec<(Arc<dyn Channel>, Arc<dyn ChannelHandler>)>>;

struct Active {
    endpoint: Arc<WebSocketHostEndpoint>,
    bound: Bound,
    activation: JoinHandle<()>,
}

/// Hosted WebSocket egress.
pub struct WebSocketHostEgress {
    egress_id: EgressId,
    bind_path: String,
    name: String,
    bindings: Vec<TopicBinding>,
    endpoints: Arc<EndpointRegistry>,
    connection: ConnectionConfig,
    active: Mutex<Option<Active>>,
}

impl WebSocketHostEgress {
    /// Creates the adapter for `egress`, one binding per source topic.
    ///
    /// # Errors
    ///
    /// [`BusError::Argument`] if `egress` is not a WebSocket host egress.
    pub fn new(
        egress: &Egress,
        bindings: Vec<TopicBinding>,
        endpoints: Arc<EndpointRegistry>,
        config: &WebSocketHostConfig,
        connection: ConnectionConfig,
    ) -> Result<Self, BusError> {
        if egress.kind() != EgressKind::WebSocketHost {
            return Err(BusError::Argument {
                name: "egress",
                message: format!(
                    "wrong egress kind for {}: {:?}, expected {:?}",
                    egress.egress_id,
                    egress.kind(),
                    EgressKind::WebSocketHost
                ),
            });
        }

        let bind_path = bind_path(config, egress.egress_id);
        debug!(egress_id = %egress.egress_id, bind_path = %bind_path, "websocket host egress constructed");
        Ok(Self {
            egress_id: egress.egress_id,
            name: format!("egress.websockethost.{}", egress.egress_id.uuid()),
            bind_path,
            bindings,
            endpoints,
            connection,
            active: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn egress_id(&self) -> EgressId {
        self.egress_id
    }

    /// Path consumers connect to.
    #[must_use]
    pub fn bind_path(&self) -> &str {
        &self.bind_path
    }

    async fn start(&self, ctx: &ExecutionContext) -> Result<(), BusError> {
        let (endpoint, transitions) = WebSocketHostEndpoint::new(
            self.egress_id,
            self.bind_path.clone(),
            self.connection.clone(),
        );

        let mut bound: Vec<(Arc<dyn Channel>, Arc<dyn ChannelHandler>)> =
            Vec::with_capacity(self.bindings.len());
        for binding in &self.bindings {
            match binding.factory.create_channel(ctx).await {
                Ok(channel) => {
                    let handler: Arc<dyn ChannelHandler> = Arc::new(PushHandler {
                        topic_name: binding.topic_name.clone(),
                        endpoint: Arc::clone(&endpoint),
                    });
                    bound.push((channel, handler));
                }
                Err(e) => {
                    release(&bound).await;
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.endpoints.mount(Arc::clone(&endpoint)) {
            release(&bound).await;
            return Err(e);
        }

        let bound: Bound = Arc::new(bound);
        let span = tracing::info_span!("websockethost", egress_id = %self.egress_id);
        let activation = tokio::spawn(run_activation(transitions, Arc::clone(&bound)).instrument(span));

        info!(
            egress_id = %self.egress_id,
            bind_path = %self.bind_path,
            channels = bound.len(),
            "websocket host endpoint mounted"
        );
        *self.active.lock() = Some(Active {
            endpoint,
            bound,
            activation,
        });
        Ok(())
    }

    async fn stop(&self) {
        let active = self.active.lock().take();
        let Some(active) = active else {
            return;
        };
        self.endpoints.unmount(self.egress_id);
        let closed = active.endpoint.close_all("endpoint disposed");
        active.activation.abort();
        for (channel, handler) in active.bound.iter() {
            channel.dispose().await;
            channel.remove_handler(handler);
        }
        info!(egress_id = %self.egress_id, closed, "websocket host endpoint unmounted");
    }
}

/// Mount path of an egress endpoint: `<base>/websockethost/<uuid>`.
#[must_use]
pub fn bind_path(config: &WebSocketHostConfig, egress_id: EgressId) -> String {
    format!("{}/websockethost/{}", config.normalized_base(), egress_id.uuid())
}

async fn release(bound: &[(Arc<dyn Channel>, Arc<dyn ChannelHandler>)]) {
    for (channel, _) in bound {
        channel.dispose().await;
    }
}

/// Attaches handlers on the first consumer and detaches them after the last.
async fn run_activation(mut transitions: mpsc::UnboundedReceiver<ConsumerTransition>, bound: Bound) {
    while let Some(transition) = transitions.recv().await {
        match transition {
            ConsumerTransition::FirstConsumerAdded => {
                debug!("first consumer connected, attaching handlers");
                for (channel, handler) in bound.iter() {
                    channel.add_handler(Arc::clone(handler));
                    channel.wake_up();
                }
            }
            ConsumerTransition::LastConsumerRemoved => {
                debug!("last consumer left, detaching handlers");
                for (channel, handler) in bound.iter() {
                    if !channel.remove_handler(handler) {
                        warn!(key = %channel.key(), "handler was not attached");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ManagedComponent for WebSocketHostEgress {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, ctx: &ExecutionContext) -> anyhow::Result<()> {
        self.start(ctx).await?;
        Ok(())
    }

    async fn dispose(&self) -> anyhow::Result<()> {
        self.stop().await;
        Ok(())
    }
}
