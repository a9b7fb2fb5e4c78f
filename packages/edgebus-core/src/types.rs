use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{
    DeliveryId, EgressId, IngressId, LabelHandlerId, LabelId, MessageId, TopicId,
};

/// A logical event stream. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    pub topic_id: TopicId,
    /// Human-readable unique name, also used as the WebSocket frame topic.
    pub topic_name: String,
    /// Optional owning domain, for grouping in management tooling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub description: String,
    /// Media type of messages published to this topic.
    pub media_type: String,
}

/// An inbound publish point bound to exactly one topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ingress {
    pub ingress_id: IngressId,
    pub topic_id: TopicId,
}

/// Discriminant for egress delivery mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EgressKind {
    /// Outbound HTTP push to a fixed URL.
    Webhook,
    /// WebSocket endpoint hosted by this server; consumers connect to it.
    WebSocketHost,
}

/// Delivery configuration of an egress, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all_fields = "camelCase")]
pub enum EgressDelivery {
    Webhook {
        /// Target URL every event is pushed to.
        url: String,
        /// Statically configured HTTP method. Overrides the envelope's method.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<String>,
    },
    WebSocketHost,
}

impl EgressDelivery {
    #[must_use]
    pub fn kind(&self) -> EgressKind {
        match self {
            Self::Webhook { .. } => EgressKind::Webhook,
            Self::WebSocketHost => EgressKind::WebSocketHost,
        }
    }
}

/// One subscriber's delivery target and the topics it listens to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Egress {
    pub egress_id: EgressId,
    pub source_topic_ids: Vec<TopicId>,
    pub delivery: EgressDelivery,
}

impl Egress {
    #[must_use]
    pub fn kind(&self) -> EgressKind {
        self.delivery.kind()
    }
}

/// Deduplicated routing tag attached to messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Label {
    pub label_id: LabelId,
    pub label_value: String,
}

/// Strategy used to compute labels for a topic's messages.
///
/// New strategies are added as variants; consumers must keep a fail-fast arm
/// for kinds they do not support.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all_fields = "camelCase")]
#[non_exhaustive]
pub enum LabelHandlerKind {
    /// Runs an external executable per message (stdin body, stdout JSON array).
    ExternalProcess { external_process_path: String },
}

/// A label computation registered for a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelHandler {
    pub label_handler_id: LabelHandlerId,
    pub topic_id: TopicId,
    #[serde(flatten)]
    pub kind: LabelHandlerKind,
}

/// Message content supplied by a publisher, before labels are resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageData {
    pub message_id: MessageId,
    pub headers: BTreeMap<String, String>,
    pub media_type: String,
    /// Body exactly as received by the ingress.
    pub ingress_body: Bytes,
    /// Body after ingress transformation; carries the delivery envelope.
    pub transformed_body: Bytes,
}

/// A persisted message. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub message_id: MessageId,
    pub ingress_id: IngressId,
    pub headers: BTreeMap<String, String>,
    pub media_type: String,
    pub ingress_body: Bytes,
    pub transformed_body: Bytes,
    pub labels: Vec<Label>,
}

impl Message {
    /// Label values in stored order.
    pub fn label_values(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(|l| l.label_value.as_str())
    }
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Success,
    Failure,
}

impl DeliveryStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// Delivery attempt fields known before the record is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryData {
    pub egress_id: EgressId,
    pub topic_id: TopicId,
    pub message_id: MessageId,
    pub status: DeliveryStatus,
    /// Free-form proof of the outcome (HTTP status, error text, consumer count).
    pub evidence: serde_json::Value,
}

/// Append-only audit record of one delivery attempt outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub delivery_id: DeliveryId,
    #[serde(flatten)]
    pub data: DeliveryData,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn egress_delivery_is_tagged_by_kind() {
        let egress = Egress {
            egress_id: EgressId::generate(),
            source_topic_ids: vec![TopicId::generate()],
            delivery: EgressDelivery::Webhook {
                url: "http://localhost:9000/hook".to_string(),
                method: None,
            },
        };
        let value = serde_json::to_value(&egress).unwrap();
        assert_eq!(value["delivery"]["kind"], "Webhook");
        assert_eq!(value["delivery"]["url"], "http://localhost:9000/hook");
        assert!(value["delivery"].get("method").is_none());
        assert_eq!(egress.kind(), EgressKind::Webhook);
    }

    #[test]
    fn websocket_egress_parses_without_config() {
        let id = EgressId::generate();
        let egress: Egress = serde_json::from_value(json!({
            "egressId": id.to_string(),
            "sourceTopicIds": [],
            "delivery": { "kind": "WebSocketHost" }
        }))
        .unwrap();
        assert_eq!(egress.kind(), EgressKind::WebSocketHost);
    }

    #[test]
    fn label_handler_flattens_kind() {
        let handler: LabelHandler = serde_json::from_value(json!({
            "labelHandlerId": LabelHandlerId::generate().to_string(),
            "topicId": TopicId::generate().to_string(),
            "kind": "ExternalProcess",
            "externalProcessPath": "gitlab_labels.sh"
        }))
        .unwrap();
        assert_eq!(
            handler.kind,
            LabelHandlerKind::ExternalProcess {
                external_process_path: "gitlab_labels.sh".to_string()
            }
        );
    }

    #[test]
    fn unknown_label_handler_kind_is_rejected() {
        let result: Result<LabelHandler, _> = serde_json::from_value(json!({
            "labelHandlerId": LabelHandlerId::generate().to_string(),
            "topicId": TopicId::generate().to_string(),
            "kind": "Wasm",
        }));
        assert!(result.is_err());
    }

    #[test]
    fn delivery_status_wire_form() {
        assert_eq!(
            serde_json::to_value(DeliveryStatus::Failure).unwrap(),
            json!("FAILURE")
        );
        assert_eq!(DeliveryStatus::Success.as_str(), "success");
    }
}
