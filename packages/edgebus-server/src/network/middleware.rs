//! HTTP middleware stack for the `EdgeBus` server.
//!
//! The first layer listed is the outermost: it sees the request first and
//! the response last.

use axum::http::header::HeaderName;
use axum::http::{Method, StatusCode};
use tower::layer::util::{Identity, Stack};
use tower::ServiceBuilder;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::config::NetworkConfig;

/// Header carrying the request id; also used as the publish correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

type HttpLayers = Stack<
    PropagateRequestIdLayer,
    Stack<
        TimeoutLayer,
        Stack<
            CorsLayer,
            Stack<
                CompressionLayer,
                Stack<
                    TraceLayer<SharedClassifier<ServerErrorsAsFailures>>,
                    Stack<SetRequestIdLayer<MakeRequestUuid>, Stack<RequestBodyLimitLayer, Identity>>,
                >,
            >,
        >,
    >,
>;

/// Builds the transport-level middleware stack.
///
/// Order, outermost first:
/// 1. `RequestBodyLimit` rejects bodies above `max_body_size` with 413.
///    It must wrap `Timeout` and `CORS`, which need a `Default` response body.
/// 2. `SetRequestId` assigns a UUID `x-request-id`
/// 3. `Trace`
/// 4. `Compression` (gzip)
/// 5. `CORS`
/// 6. `Timeout` answers 408 after `request_timeout`
/// 7. `PropagateRequestId` copies the id onto the response
#[must_use]
pub fn build_http_layers(config: &NetworkConfig) -> HttpLayers {
    let x_request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    ServiceBuilder::new()
        .layer(RequestBodyLimitLayer::new(config.max_body_size))
        .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(build_cors_layer(&config.cors_origins))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout,
        ))
        .layer(PropagateRequestIdLayer::new(x_request_id))
        .into_inner()
}

/// `"*"` allows any origin; otherwise only the parseable origins listed.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let parsed: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers(Any)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn layers_build_with_defaults() {
        let _layers = build_http_layers(&NetworkConfig::default());
    }

    #[test]
    fn layers_build_with_custom_limits() {
        let config = NetworkConfig {
            request_timeout: Duration::from_secs(5),
            max_body_size: 1024,
            cors_origins: vec!["http://localhost:3000".to_string()],
            ..NetworkConfig::default()
        };
        let _layers = build_http_layers(&config);
    }

    #[test]
    fn cors_accepts_unparseable_origins() {
        let _cors = build_cors_layer(&["not an origin\n".to_string()]);
    }
}
