//! Delivery envelope embedded in a message's transformed body.
//!
//! Ingress publishers that receive HTTP requests store the original method,
//! headers and body as JSON so egress adapters can replay the request:
//!
//! ```json
//! { "method": "PUT", "headers": { "x-event": "push" }, "body": { "x": 1 } }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Describes how to replay a message as an outbound HTTP request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryEnvelope {
    /// HTTP method of the original request, if recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Headers to send with the outbound request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Request body; re-serialized as JSON on delivery.
    #[serde(default)]
    pub body: serde_json::Value,
}

impl DeliveryEnvelope {
    /// Parses an envelope from a message's transformed body.
    ///
    /// # Errors
    ///
    /// Returns the JSON error if the bytes are not an envelope object.
    pub fn from_slice(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }

    /// Serializes the `body` field for the outbound request.
    ///
    /// # Errors
    ///
    /// Returns the JSON error if serialization fails.
    pub fn body_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.body)
    }
}
