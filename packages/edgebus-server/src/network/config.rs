//! HTTP listener and consumer session settings.

use std::time::Duration;

/// Listener, middleware and drain settings.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub host: String,
    /// 0 lets the OS pick; the bound port is returned by `NetworkModule::start`.
    pub port: u16,
    pub connection: ConnectionConfig,
    /// `*` allows any origin.
    pub cors_origins: Vec<String>,
    /// Upper bound for one HTTP request, ingress publishes included.
    pub request_timeout: Duration,
    /// Largest ingress body accepted, in bytes.
    pub max_body_size: usize,
    /// How long shutdown waits for publishes still running.
    pub drain_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            connection: ConnectionConfig::default(),
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(30),
            max_body_size: 4 * 1024 * 1024,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Settings of one WebSocket consumer session.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Frames buffered per consumer before a broadcast waits.
    pub outbound_channel_capacity: usize,
    /// A consumer that cannot take a frame within this window is skipped
    /// for that message.
    pub send_timeout: Duration,
    pub ws_write_buffer_size: usize,
    pub ws_max_write_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_channel_capacity: 256,
            send_timeout: Duration::from_secs(5),
            ws_write_buffer_size: 128 * 1024,
            ws_max_write_buffer_size: 512 * 1024,
        }
    }
}
