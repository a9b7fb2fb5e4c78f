//! Build information endpoint.

use axum::Json;
use serde_json::json;

/// `GET /info`: package version, title and description.
pub async fn info_handler() -> Json<serde_json::Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "title": env!("CARGO_PKG_NAME"),
        "description": env!("CARGO_PKG_DESCRIPTION"),
    }))
}
