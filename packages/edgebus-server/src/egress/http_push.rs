//! HTTP push egress: replays each message as an HTTP request to a fixed URL.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use edgebus_core::{DeliveryEnvelope, Egress, EgressDelivery, EgressId, Message};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use http::method::InvalidMethod;
use parking_lot::Mutex;
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::json;
use tracing::{debug, info, warn};

use super::TopicBinding;
use crate::bus::{Channel, ChannelEvent, ChannelHandler};
use crate::config::HttpPushConfig;
use crate::context::ExecutionContext;
use crate::error::BusError;
use crate::service::registry::ManagedComponent;

/// Builds the client shared by every HTTP push egress.
///
/// # Errors
///
/// [`BusError::InvalidOperation`] if the TLS backend cannot be initialized.
pub fn build_client(config: &HttpPushConfig) -> Result<Client, BusError> {
    Client::builder()
        .timeout(config.request_timeout)
        .connect_timeout(config.connect_timeout)
        .user_agent(config.user_agent.as_str())
        .build()
        .map_err(|e| BusError::InvalidOperation(format!("cannot build HTTP client: {e}")))
}

/// Picks the outbound method: configured, then the envelope's, then `POST`.
///
/// # Errors
///
/// Returns the parse error of an invalid envelope method.
pub fn resolve_method(
    configured: Option<&Method>,
    envelope: Option<&str>,
) -> Result<Method, InvalidMethod> {
    if let Some(method) = configured {
        return Ok(method.clone());
    }
    match envelope {
        Some(name) => Method::from_bytes(name.trim().to_ascii_uppercase().as_bytes()),
        None => Ok(Method::POST),
    }
}

/// Converts envelope headers, dropping the ones the client computes itself
/// and the ones that are not valid HTTP.
fn outbound_headers(envelope: &DeliveryEnvelope) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(envelope.headers.len() + 1);
    for (name, value) in &envelope.headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            debug!(header = %name, "skipping invalid envelope header");
            continue;
        };
        if name == HOST || name == CONTENT_LENGTH {
            continue;
        }
        headers.insert(name, value);
    }
    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    headers
}

struct PushHandler {
    client: Client,
    url: Url,
    method: Option<Method>,
}

impl PushHandler {
    async fn deliver(&self, message: &Message) -> anyhow::Result<StatusCode> {
        let envelope = DeliveryEnvelope::from_slice(&message.transformed_body)
            .context("transformed body is not a delivery envelope")?;
        let method = resolve_method(self.method.as_ref(), envelope.method.as_deref())
            .context("envelope carries an invalid HTTP method")?;
        let body = envelope.body_bytes()?;

        let response = self
            .client
            .request(method, self.url.clone())
            .headers(outbound_headers(&envelope))
            .body(body)
            .send()
            .await?;
        Ok(response.status())
    }
}

#[async_trait]
impl ChannelHandler for PushHandler {
    async fn handle(&self, _ctx: &ExecutionContext, event: &ChannelEvent) -> anyhow::Result<()> {
        let message_id = event.message().message_id;
        match self.deliver(event.message()).await {
            Ok(status) if status.is_success() => {
                info!(key = %event.key(), message_id = %message_id, status = status.as_u16(), "event delivered");
                event.mark_delivered(json!({ "status": status.as_u16() }));
            }
            Ok(status) => {
                warn!(key = %event.key(), message_id = %message_id, status = status.as_u16(), "delivery rejected by target");
                event.mark_not_delivered(json!({ "status": status.as_u16() }));
            }
            Err(e) => {
                warn!(key = %event.key(), message_id = %message_id, error = %format!("{e:#}"), "event was not delivered");
                event.mark_not_delivered(json!({ "error": format!("{e:#}") }));
            }
        }
        Ok(())
    }
}

/// Webhook egress.
pub struct HttpPushEgress {
    egress_id: EgressId,
    name: String,
    bindings: Vec<TopicBinding>,
    handler: Arc<dyn ChannelHandler>,
    channels: Mutex<Option<Vec<Arc<dyn Channel>>>>,
}

impl HttpPushEgress {
    /// Creates the adapter for `egress`, one binding per source topic.
    ///
    /// # Errors
    ///
    /// [`BusError::Argument`] on a non-webhook egress, an invalid URL, or an
    /// invalid configured method.
    pub fn new(egress: &Egress, bindings: Vec<TopicBinding>, client: Client) -> Result<Self, BusError> {
        let EgressDelivery::Webhook { url, method } = &egress.delivery else {
            return Err(BusError::Argument {
                name: "egress",
                message: format!(
                    "wrong egress kind for {}: {:?}, expected Webhook",
                    egress.egress_id,
                    egress.kind()
                ),
            });
        };
        let url = Url::parse(url).map_err(|e| BusError::Argument {
            name: "delivery.url",
            message: format!("{url}: {e}"),
        })?;
        let method = method
            .as_deref()
            .map(|m| resolve_method(None, Some(m)))
            .transpose()
            .map_err(|e| BusError::Argument {
                name: "delivery.method",
                message: e.to_string(),
            })?;

        debug!(egress_id = %egress.egress_id, url = %url, method = ?method, "http push egress constructed");
        Ok(Self {
            egress_id: egress.egress_id,
            name: format!("egress.webhook.{}", egress.egress_id.uuid()),
            bindings,
            handler: Arc::new(PushHandler { client, url, method }),
            channels: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn egress_id(&self) -> EgressId {
        self.egress_id
    }

    async fn start(&self, ctx: &ExecutionContext) -> Result<(), BusError> {
        let mut channels: Vec<Arc<dyn Channel>> = Vec::with_capacity(self.bindings.len());
        for binding in &self.bindings {
            match binding.factory.create_channel(ctx).await {
                Ok(channel) => {
                    channel.add_handler(Arc::clone(&self.handler));
                    channels.push(channel);
                }
                Err(e) => {
                    for channel in &channels {
                        channel.dispose().await;
                    }
                    return Err(e);
                }
            }
        }
        info!(egress_id = %self.egress_id, channels = channels.len(), "http push egress started");
        *self.channels.lock() = Some(channels);
        Ok(())
    }

    async fn stop(&self) {
        let channels = self.channels.lock().take();
        let Some(channels) = channels else {
            return;
        };
        for channel in &channels {
            channel.dispose().await;
            channel.remove_handler(&self.handler);
        }
        info!(egress_id = %self.egress_id, "http push egress stopped");
    }
}

#[async_trait]
impl ManagedComponent for HttpPushEgress {
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

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use bytes::Bytes;
    use edgebus_core::{IngressId, MessageId, TopicId};

    use super::*;
    use crate::bus::{ChannelKey, DeliveryMark};

    #[test]
    fn method_defaults_to_post() {
        assert_eq!(resolve_method(None, None).unwrap(), Method::POST);
    }

    #[test]
    fn envelope_method_is_used_when_not_configured() {
        assert_eq!(resolve_method(None, Some("put")).unwrap(), Method::PUT);
    }

    #[test]
    fn configured_method_wins() {
        assert_eq!(
            resolve_method(Some(&Method::PATCH), Some("PUT")).unwrap(),
            Method::PATCH
        );
    }

    #[test]
    fn invalid_envelope_method_is_an_error() {
        assert!(resolve_method(None, Some("NOT A METHOD")).is_err());
    }

    #[test]
    fn host_and_length_headers_are_dropped() {
        let envelope = DeliveryEnvelope {
            method: None,
            headers: BTreeMap::from([
                ("Host".to_string(), "example.org".to_string()),
                ("content-length".to_string(), "12".to_string()),
                ("x-event".to_string(), "push".to_string()),
                ("bad header".to_string(), "x".to_string()),
            ]),
            body: json!(null),
        };
        let headers = outbound_headers(&envelope);
        assert!(headers.get(HOST).is_none());
        assert!(headers.get(CONTENT_LENGTH).is_none());
        assert_eq!(headers.get("x-event").unwrap(), "push");
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(headers.len(), 2);
    }

    fn egress(url: &str, method: Option<&str>) -> Egress {
        Egress {
            egress_id: EgressId::generate(),
            source_topic_ids: Vec::new(),
            delivery: EgressDelivery::Webhook {
                url: url.to_string(),
                method: method.map(str::to_string),
            },
        }
    }

    #[test]
    fn constructor_validates_delivery() {
        let client = Client::new();
        assert!(HttpPushEgress::new(&egress("http://127.0.0.1:9/", None), Vec::new(), client.clone()).is_ok());
        assert!(matches!(
            HttpPushEgress::new(&egress("not a url", None), Vec::new(), client.clone()),
            Err(BusError::Argument { name: "delivery.url", .. })
        ));
        assert!(matches!(
            HttpPushEgress::new(&egress("http://127.0.0.1:9/", Some("BAD METHOD")), Vec::new(), client.clone()),
            Err(BusError::Argument { name: "delivery.method", .. })
        ));

        let mut websocket = egress("http://127.0.0.1:9/", None);
        websocket.delivery = EgressDelivery::WebSocketHost;
        assert!(matches!(
            HttpPushEgress::new(&websocket, Vec::new(), client),
            Err(BusError::Argument { name: "egress", .. })
        ));
    }

    #[tokio::test]
    async fn non_envelope_body_is_not_delivered() {
        let handler = PushHandler {
            client: Client::new(),
            url: Url::parse("http://127.0.0.1:9/").unwrap(),
            method: None,
        };
        let message = Message {
            message_id: MessageId::generate(),
            ingress_id: IngressId::generate(),
            headers: BTreeMap::new(),
            media_type: "text/plain".to_string(),
            ingress_body: Bytes::from_static(b"hello"),
            transformed_body: Bytes::from_static(b"hello"),
            labels: Vec::new(),
        };
        let event = ChannelEvent::new(
            ChannelKey::new(TopicId::generate(), EgressId::generate()),
            Arc::new(message),
        );

        handler.handle(&ExecutionContext::new(), &event).await.unwrap();
        assert!(matches!(event.mark(), DeliveryMark::NotDelivered(_)));
    }
}
