//! `EdgeBus` launcher.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use edgebus_server::app::Edgebus;
use edgebus_server::config::{EdgebusConfig, WebSocketHostConfig};
use edgebus_server::storage::{InMemoryDatabaseFactory, MemorySeed};
use edgebus_server::telemetry::{self, LogFormat};
use tracing::{error, info};

/// Command line options. Every flag falls back to an environment variable.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Bind address of the HTTP server
    #[arg(long, env = "EDGEBUS_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port of the HTTP server
    #[arg(long, env = "EDGEBUS_PORT", default_value_t = 8080)]
    port: u16,

    /// JSON file with topics, ingresses, egresses and label handlers
    #[arg(long, env = "EDGEBUS_BOOTSTRAP")]
    bootstrap: Option<PathBuf>,

    /// Path prefix of hosted WebSocket endpoints
    #[arg(long, env = "EDGEBUS_WEBSOCKET_BASE_PATH", default_value = "")]
    websocket_base_path: String,

    /// Directory external label handler paths are resolved against
    #[arg(long, env = "EDGEBUS_LABEL_HANDLERS_DIR", default_value = "label_handlers")]
    label_handlers_dir: PathBuf,

    /// Delivery poll interval of active channels, in milliseconds
    #[arg(long, env = "EDGEBUS_POLL_INTERVAL_MS", default_value_t = 500)]
    poll_interval_ms: u64,

    /// Allowed CORS origins, comma separated
    #[arg(long, env = "EDGEBUS_CORS_ORIGINS", value_delimiter = ',', default_value = "*")]
    cors_origins: Vec<String>,

    /// Log output format
    #[arg(long, env = "EDGEBUS_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl Cli {
    fn into_config(self) -> EdgebusConfig {
        let mut config = EdgebusConfig::default();
        config.network.host = self.host;
        config.network.port = self.port;
        config.network.cors_origins = self.cors_origins;
        config.bus.poll_interval = Duration::from_millis(self.poll_interval_ms.max(1));
        config.labels.handlers_dir = self.label_handlers_dir;
        config.websocket_host = WebSocketHostConfig {
            base_bind_path: self.websocket_base_path,
        };
        config
    }
}

fn load_seed(path: &Path) -> anyhow::Result<MemorySeed> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read bootstrap file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("invalid bootstrap file {}", path.display()))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.log_format)?;

    let seed = match &cli.bootstrap {
        Some(path) => load_seed(path)?,
        None => MemorySeed::default(),
    };
    info!(
        topics = seed.topics.len(),
        ingresses = seed.ingresses.len(),
        egresses = seed.egresses.len(),
        label_handlers = seed.label_handlers.len(),
        "bootstrap loaded"
    );
    let storage = Arc::new(InMemoryDatabaseFactory::from_seed(seed));

    let mut edgebus = Edgebus::build(cli.into_config(), storage).await?;
    let port = edgebus.start().await?;
    info!(port, "edgebus listening");

    edgebus.run(shutdown_signal()).await
}
