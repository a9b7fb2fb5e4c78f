//! HTTP and WebSocket handlers and the state they share.

pub mod health;
pub mod info;
pub mod ingress;
pub mod websocket;

pub use health::{health_handler, liveness_handler, readiness_handler};
pub use info::info_handler;
pub use ingress::ingress_handler;
pub use websocket::ws_upgrade_handler;

use std::sync::Arc;
use std::time::Instant;

use super::{NetworkConfig, ShutdownController};
use crate::bus::MessageBus;
use crate::egress::EndpointRegistry;

/// State handed to every axum handler. Cloning only bumps `Arc` counts.
#[derive(Clone)]
pub struct AppState {
    /// Publish target of the ingress handler.
    pub bus: Arc<MessageBus>,
    /// Hosted WebSocket endpoints, looked up on upgrade.
    pub endpoints: Arc<EndpointRegistry>,
    pub shutdown: Arc<ShutdownController>,
    pub config: Arc<NetworkConfig>,
    /// Server start time, for uptime.
    pub start_time: Instant,
}

#[cfg(test)]
pub(crate) fn test_state() -> AppState {
    use std::time::Duration;

    use crate::bus::{CompositeDeliveryObserver, LocalBusBackend};
    use crate::labels::ExternalProcessConfig;
    use crate::storage::InMemoryDatabaseFactory;

    let backend = LocalBusBackend::new(
        Duration::from_millis(10),
        Arc::new(CompositeDeliveryObserver::default()),
    );
    let bus = MessageBus::new(
        Arc::new(InMemoryDatabaseFactory::new()),
        Arc::new(backend),
        ExternalProcessConfig::default(),
    );
    AppState {
        bus: Arc::new(bus),
        endpoints: Arc::new(EndpointRegistry::new()),
        shutdown: Arc::new(ShutdownController::new()),
        config: Arc::new(NetworkConfig::default()),
        start_time: Instant::now(),
    }
}
