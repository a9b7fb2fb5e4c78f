//! `EdgeBus` Server: message bus engine, delivery channels, label handlers,
//! and WebSocket / HTTP push egress.

pub mod app;
pub mod bus;
pub mod config;
pub mod context;
pub mod egress;
pub mod error;
pub mod labels;
pub mod network;
pub mod service;
pub mod storage;
pub mod telemetry;
pub mod traits;

pub use app::Edgebus;
pub use bus::MessageBus;
pub use config::EdgebusConfig;
pub use context::ExecutionContext;
pub use error::BusError;
pub use traits::{Database, DatabaseFactory, TopicLookup};
