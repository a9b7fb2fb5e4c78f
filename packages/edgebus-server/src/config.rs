//! Server configuration assembled by the launcher.

use std::time::Duration;

pub use crate::labels::ExternalProcessConfig;
pub use crate::network::config::{ConnectionConfig, NetworkConfig};

/// Delivery channel settings of the in-process bus.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Interval between delivery attempts of an Active channel.
    pub poll_interval: Duration,
    /// Capacity of the delivery audit queue.
    pub delivery_audit_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            delivery_audit_capacity: 1024,
        }
    }
}

/// Outbound HTTP push settings shared by all webhook egresses.
#[derive(Debug, Clone)]
pub struct HttpPushConfig {
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Connection establishment timeout.
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpPushConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: concat!("edgebus/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Settings of hosted WebSocket egress endpoints.
#[derive(Debug, Clone, Default)]
pub struct WebSocketHostConfig {
    /// Path prefix endpoints are mounted under; trailing slashes are ignored.
    /// Empty mounts at `/websockethost/<id>`.
    pub base_bind_path: String,
}

impl WebSocketHostConfig {
    /// Base path with one leading slash and no trailing slashes; empty for
    /// the root.
    #[must_use]
    pub fn normalized_base(&self) -> String {
        let trimmed = self.base_bind_path.trim().trim_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{trimmed}")
        }
    }
}

/// Complete server configuration.
#[derive(Debug, Clone, Default)]
pub struct EdgebusConfig {
    pub network: NetworkConfig,
    pub bus: BusConfig,
    pub labels: ExternalProcessConfig,
    pub http_push: HttpPushConfig,
    pub websocket_host: WebSocketHostConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_defaults_to_half_second_poll() {
        assert_eq!(BusConfig::default().poll_interval, Duration::from_millis(500));
    }

    #[test]
    fn label_timeouts_default() {
        let config = EdgebusConfig::default();
        assert_eq!(config.labels.spawn_timeout, Duration::from_secs(5));
        assert_eq!(config.labels.execution_timeout, Duration::from_secs(10));
    }

    #[test]
    fn base_path_trailing_slashes_are_trimmed() {
        let config = WebSocketHostConfig {
            base_bind_path: "/bus//".to_string(),
        };
        assert_eq!(config.normalized_base(), "/bus");
        assert_eq!(WebSocketHostConfig::default().normalized_base(), "");

        let relative = WebSocketHostConfig {
            base_bind_path: "bus/v1/".to_string(),
        };
        assert_eq!(relative.normalized_base(), "/bus/v1");
    }
}
