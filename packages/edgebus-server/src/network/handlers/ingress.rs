//! HTTP ingress: turns a request into a published message.
//!
//! The request's method, headers and body are stored as the message's
//! delivery envelope so webhook egresses can replay it.

use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use edgebus_core::{DeliveryEnvelope, IngressId, MessageData, MessageId};
use serde_json::{json, Value};
use tracing::warn;

use super::AppState;
use crate::context::ExecutionContext;
use crate::error::BusError;
use crate::network::middleware::REQUEST_ID_HEADER;
use crate::storage::{storage_error, StorageError};

/// Headers never copied into a message: hop-by-hop and transport framing.
const SKIPPED_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
    "accept-encoding",
];

const DEFAULT_MEDIA_TYPE: &str = "application/octet-stream";

/// `POST|PUT /ingress/{ingressId}`.
pub async fn ingress_handler(
    State(state): State<AppState>,
    Path(raw_ingress_id): Path<String>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !state.shutdown.is_accepting() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "server is not accepting messages");
    }
    let _guard = state.shutdown.in_flight_guard();

    let ingress_id: IngressId = match raw_ingress_id.parse() {
        Ok(id) => id,
        Err(e) => {
            let err = BusError::identifier("ingressId", &e);
            return error_response(status_for(&err), &err.to_string());
        }
    };

    let ctx = match headers.get(REQUEST_ID_HEADER).and_then(|v| v.to_str().ok()) {
        Some(request_id) => ExecutionContext::with_correlation_id(request_id),
        None => ExecutionContext::new(),
    };

    let data = match message_data(&method, &headers, body) {
        Ok(data) => data,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };

    match state.bus.publish(&ctx, ingress_id, data).await {
        Ok(message) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "messageId": message.message_id,
                "labels": message.label_values().collect::<Vec<_>>(),
            })),
        )
            .into_response(),
        Err(e) => {
            let status = status_for(&e);
            if status.is_server_error() {
                warn!(ingress_id = %ingress_id, error = %e, "publish failed");
            }
            error_response(status, &e.to_string())
        }
    }
}

/// Builds the message for a request, embedding the delivery envelope in the
/// transformed body.
///
/// # Errors
///
/// Returns the JSON error if the envelope cannot be serialized.
pub fn message_data(
    method: &Method,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<MessageData, serde_json::Error> {
    let headers = copy_headers(headers);
    let media_type = headers
        .get("content-type")
        .cloned()
        .unwrap_or_else(|| DEFAULT_MEDIA_TYPE.to_string());

    let envelope = DeliveryEnvelope {
        method: Some(method.as_str().to_string()),
        headers: headers.clone(),
        body: body_value(&body),
    };
    let transformed_body = Bytes::from(serde_json::to_vec(&envelope)?);

    Ok(MessageData {
        message_id: MessageId::generate(),
        headers,
        media_type,
        ingress_body: body,
        transformed_body,
    })
}

/// Request headers worth replaying, lower-cased. Repeated headers are joined
/// with `", "`; non-UTF-8 values are dropped.
fn copy_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut copied: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let name = name.as_str();
        if SKIPPED_HEADERS.contains(&name) {
            continue;
        }
        let Ok(value) = value.to_str() else {
            continue;
        };
        copied
            .entry(name.to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    copied
}

/// JSON bodies are embedded as JSON, anything else as a string.
fn body_value(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

fn status_for(err: &BusError) -> StatusCode {
    match err {
        BusError::Argument { .. } => StatusCode::BAD_REQUEST,
        BusError::InvalidOperation(_) => StatusCode::CONFLICT,
        BusError::Aggregate(_) => StatusCode::UNPROCESSABLE_ENTITY,
        BusError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        BusError::Storage(inner) => match storage_error(inner) {
            Some(StorageError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Some(StorageError::Cancelled) => StatusCode::SERVICE_UNAVAILABLE,
            Some(StorageError::Conflict { .. }) => StatusCode::CONFLICT,
            None => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
