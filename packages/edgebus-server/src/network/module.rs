//! Network module with deferred startup lifecycle.
//!
//! `new()` allocates shared state, `start()` binds the listener and
//! `serve()` accepts connections. Components are initialized between
//! `start()` and `serve()` so ingress opens only once delivery is wired.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::handlers::{
    health_handler, info_handler, ingress_handler, liveness_handler, readiness_handler,
    ws_upgrade_handler, AppState,
};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;
use crate::bus::MessageBus;
use crate::config::WebSocketHostConfig;
use crate::egress::EndpointRegistry;

/// The HTTP/WebSocket server.
pub struct NetworkModule {
    config: NetworkConfig,
    websocket_base: String,
    listener: Option<TcpListener>,
    bus: Arc<MessageBus>,
    endpoints: Arc<EndpointRegistry>,
    shutdown: Arc<ShutdownController>,
}

impl NetworkModule {
    /// Creates the module without binding any port.
    #[must_use]
    pub fn new(
        config: NetworkConfig,
        websocket_host: &WebSocketHostConfig,
        bus: Arc<MessageBus>,
        endpoints: Arc<EndpointRegistry>,
    ) -> Self {
        Self {
            config,
            websocket_base: websocket_host.normalized_base(),
            listener: None,
            bus,
            endpoints,
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Assembles the router.
    ///
    /// Routes:
    /// - `GET /health`, `/health/live`, `/health/ready`
    /// - `GET /info`
    /// - `POST|PUT /ingress/{ingressId}`
    /// - `GET <base>/websockethost/{id}` (WebSocket consumers)
    pub fn build_router(&self) -> Router {
        let state = AppState {
            bus: Arc::clone(&self.bus),
            endpoints: Arc::clone(&self.endpoints),
            shutdown: Arc::clone(&self.shutdown),
            config: Arc::new(self.config.clone()),
            start_time: Instant::now(),
        };

        let websocket_route = format!("{}/websockethost/{{id}}", self.websocket_base);

        Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .route("/info", get(info_handler))
            .route(
                "/ingress/{ingress_id}",
                axum::routing::post(ingress_handler).put(ingress_handler),
            )
            .route(&websocket_route, get(ws_upgrade_handler))
            .layer(build_http_layers(&self.config))
            .with_state(state)
    }

    /// Binds the listener. Returns the bound port (OS-assigned for port 0).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!(host = %self.config.host, port, "TCP listener bound");

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then drains.
    ///
    /// # Errors
    ///
    /// Fails if `start()` was not called, or on a fatal I/O error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow!("start() must be called before serve()"))?;
        let router = self.build_router();

        self.shutdown.set_ready();
        info!("serving HTTP/WS connections");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        drain_connections(&self.endpoints, &self.shutdown, &self.config).await;
        Ok(())
    }
}

/// Closes every consumer session and waits for in-flight publishes.
async fn drain_connections(
    endpoints: &EndpointRegistry,
    shutdown: &ShutdownController,
    config: &NetworkConfig,
) {
    shutdown.trigger_shutdown();

    let closed = endpoints.close_all("server shutting down");
    if closed > 0 {
        info!(consumers = closed, "closed consumer sessions");
    }

    if shutdown.wait_for_drain(config.drain_timeout).await {
        info!("all in-flight work drained");
    } else {
        warn!(
            in_flight = shutdown.in_flight_count(),
            "drain timeout expired with in-flight work remaining"
        );
    }
}
