//! WebSocket consumer sessions of hosted egress endpoints.

use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use edgebus_core::EgressId;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use super::AppState;
use crate::egress::endpoint::OutboundFrame;
use crate::egress::WebSocketHostEndpoint;

/// Subprotocol offered to consumers.
pub const JSONRPC_PROTOCOL: &str = "jsonrpc";

/// `GET <base>/websockethost/{id}`: attaches a consumer to the endpoint of
/// egress `id` (bare UUID).
pub async fn ws_upgrade_handler(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let Ok(uuid) = Uuid::parse_str(&raw_id) else {
        return (StatusCode::BAD_REQUEST, "malformed endpoint id").into_response();
    };
    let Some(endpoint) = state.endpoints.get(EgressId::from_uuid(uuid)) else {
        return (StatusCode::NOT_FOUND, "no such endpoint").into_response();
    };
    if !state.shutdown.is_accepting() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down").into_response();
    }

    let config = &state.config.connection;
    let span = info_span!("consumer", bind_path = %endpoint.bind_path());
    ws.protocols([JSONRPC_PROTOCOL])
        .write_buffer_size(config.ws_write_buffer_size)
        .max_write_buffer_size(config.ws_max_write_buffer_size)
        .on_upgrade(move |socket| run_session(socket, endpoint).instrument(span))
}

/// Pumps frames from the endpoint to the socket until either side closes.
async fn run_session(socket: WebSocket, endpoint: Arc<WebSocketHostEndpoint>) {
    let (mut sink, mut stream) = socket.split();
    let (consumer, mut rx) = endpoint.register();
    let consumer_id = consumer.id;
    // The endpoint holds the only sender so `close_all` ends the writer.
    drop(consumer);

    let writer = async {
        while let Some(frame) = rx.recv().await {
            match frame {
                OutboundFrame::Text(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                OutboundFrame::Close(reason) => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::AWAY,
                            reason: reason.unwrap_or_default().into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    };

    // Inbound frames carry nothing for a consumer; only closure matters.
    let reader = async {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };

    tokio::select! {
        () = writer => {}
        () = reader => {}
    }

    endpoint.remove(consumer_id);
    debug!(consumer = consumer_id.0, "consumer session ended");
}
