//! Egress adapters: deliver channel events to subscribers.

pub mod endpoint;
pub mod http_push;
pub mod websocket;

use std::collections::HashMap;
use std::sync::Arc;

use edgebus_core::{Egress, EgressDelivery, Topic, TopicId};
use reqwest::Client;

pub use endpoint::{EndpointRegistry, WebSocketHostEndpoint};
pub use http_push::HttpPushEgress;
pub use websocket::WebSocketHostEgress;

use crate::bus::{ChannelFactory, MessageBus};
use crate::config::{ConnectionConfig, WebSocketHostConfig};
use crate::error::BusError;
use crate::service::registry::ManagedComponent;

/// One source topic of an egress and the deferred retain of its channel.
pub struct TopicBinding {
    pub topic_name: String,
    pub factory: Arc<dyn ChannelFactory>,
}

/// Shared dependencies of egress adapters.
#[derive(Clone)]
pub struct EgressDeps {
    pub bus: Arc<MessageBus>,
    pub endpoints: Arc<EndpointRegistry>,
    pub http_client: Client,
    pub websocket_host: WebSocketHostConfig,
    pub connection: ConnectionConfig,
}

/// Builds the adapter for `egress` according to its delivery kind.
///
/// # Errors
///
/// [`BusError::Argument`] if a source topic is unknown or the delivery
/// settings are invalid.
pub fn build_egress(
    egress: &Egress,
    topics: &HashMap<TopicId, Topic>,
    deps: &EgressDeps,
) -> Result<Arc<dyn ManagedComponent>, BusError> {
    let mut bindings = Vec::with_capacity(egress.source_topic_ids.len());
    for topic_id in &egress.source_topic_ids {
        let topic = topics.get(topic_id).ok_or_else(|| BusError::Argument {
            name: "egress.sourceTopicIds",
            message: format!("{} references unknown topic {topic_id}", egress.egress_id),
        })?;
        bindings.push(TopicBinding {
            topic_name: topic.topic_name.clone(),
            factory: deps.bus.channel_factory(topic.topic_id, egress.egress_id),
        });
    }

    let component: Arc<dyn ManagedComponent> = match &egress.delivery {
        EgressDelivery::Webhook { .. } => Arc::new(HttpPushEgress::new(
            egress,
            bindings,
            deps.http_client.clone(),
        )?),
        EgressDelivery::WebSocketHost => Arc::new(WebSocketHostEgress::new(
            egress,
            bindings,
            Arc::clone(&deps.endpoints),
            &deps.websocket_host,
            deps.connection.clone(),
        )?),
    };
    Ok(component)
}
