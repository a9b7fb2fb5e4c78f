//! Application assembly: storage, bus, egress adapters, and the HTTP server.
//!
//! Dependencies are passed explicitly through constructors. Lifecycle peers
//! are registered in a [`ComponentRegistry`] in dependency order:
//! delivery recorder, message bus, then one adapter per egress.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use edgebus_core::{Egress, Topic};
use tracing::{info, warn};

use crate::bus::{
    CompositeDeliveryObserver, DeliveryObserver, DeliveryRecorder, LocalBusBackend, MessageBus,
};
use crate::config::EdgebusConfig;
use crate::context::ExecutionContext;
use crate::egress::{build_egress, http_push, EgressDeps, EndpointRegistry};
use crate::error::BusError;
use crate::network::{NetworkModule, ShutdownController};
use crate::service::registry::ComponentRegistry;
use crate::storage;
use crate::traits::DatabaseFactory;

/// A fully wired `EdgeBus` server.
pub struct Edgebus {
    ctx: ExecutionContext,
    bus: Arc<MessageBus>,
    endpoints: Arc<EndpointRegistry>,
    components: ComponentRegistry,
    network: NetworkModule,
}

impl Edgebus {
    /// Wires every component from the records in `storage`.
    ///
    /// Topics and egresses are registered with the bus here; channels are
    /// retained later, when [`start`](Self::start) initializes the adapters.
    ///
    /// # Errors
    ///
    /// Storage failures or invalid egress records.
    pub async fn build(
        config: EdgebusConfig,
        storage: Arc<dyn DatabaseFactory>,
    ) -> Result<Self, BusError> {
        let ctx = ExecutionContext::with_correlation_id("edgebus");

        let recorder = Arc::new(DeliveryRecorder::start(
            Arc::clone(&storage),
            config.bus.delivery_audit_capacity,
        ));
        let observer =
            CompositeDeliveryObserver::new(vec![Arc::clone(&recorder) as Arc<dyn DeliveryObserver>]);
        let backend = LocalBusBackend::new(config.bus.poll_interval, Arc::new(observer));
        let bus = Arc::new(MessageBus::new(
            Arc::clone(&storage),
            Arc::new(backend),
            config.labels.clone(),
        ));
        let endpoints = Arc::new(EndpointRegistry::new());

        let (topics, egresses) = load_topology(storage.as_ref(), &ctx).await?;
        for topic in &topics {
            bus.register_topic(&ctx, topic.topic_id).await?;
        }
        for egress in &egresses {
            bus.register_egress(&ctx, egress.egress_id).await?;
        }

        let components = ComponentRegistry::new();
        components.register(recorder);
        components.register(Arc::clone(&bus) as _);

        let deps = EgressDeps {
            bus: Arc::clone(&bus),
            endpoints: Arc::clone(&endpoints),
            http_client: http_push::build_client(&config.http_push)?,
            websocket_host: config.websocket_host.clone(),
            connection: config.network.connection.clone(),
        };
        let topics_by_id: HashMap<_, _> = topics.into_iter().map(|t| (t.topic_id, t)).collect();
        for egress in &egresses {
            components.register(build_egress(egress, &topics_by_id, &deps)?);
        }

        info!(
            topics = topics_by_id.len(),
            egresses = egresses.len(),
            components = ?components.names(),
            "edgebus assembled"
        );

        let network = NetworkModule::new(
            config.network,
            &config.websocket_host,
            Arc::clone(&bus),
            Arc::clone(&endpoints),
        );

        Ok(Self {
            ctx,
            bus,
            endpoints,
            components,
            network,
        })
    }

    #[must_use]
    pub fn bus(&self) -> Arc<MessageBus> {
        Arc::clone(&self.bus)
    }

    #[must_use]
    pub fn endpoints(&self) -> Arc<EndpointRegistry> {
        Arc::clone(&self.endpoints)
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        self.network.shutdown_controller()
    }

    /// Component names in initialization order.
    #[must_use]
    pub fn component_names(&self) -> Vec<String> {
        self.components.names()
    }

    /// Initializes every component, then binds the listener. Returns the
    /// bound port.
    ///
    /// # Errors
    ///
    /// The first component failure (already rolled back), or a bind failure
    /// (after disposing all components).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        self.components.init_all(&self.ctx).await?;
        match self.network.start().await {
            Ok(port) => Ok(port),
            Err(e) => {
                if let Err(dispose_err) = self.components.dispose_all().await {
                    warn!(error = %dispose_err, "dispose after failed start");
                }
                Err(e)
            }
        }
    }

    /// Serves until `shutdown` resolves, then disposes components in reverse
    /// order.
    ///
    /// # Errors
    ///
    /// Server I/O failures or the first dispose failure.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let Self {
            ctx,
            components,
            network,
            ..
        } = self;

        let served = network.serve(shutdown).await;
        ctx.cancel();
        let disposed = components.dispose_all().await;
        info!("edgebus stopped");
        served.and(disposed)
    }
}

async fn load_topology(
    storage: &dyn DatabaseFactory,
    ctx: &ExecutionContext,
) -> Result<(Vec<Topic>, Vec<Egress>), BusError> {
    let mut db = storage.begin(ctx).await?;
    let result = async {
        let mut topics = db.list_topics(ctx).await?;
        let mut egresses = db.list_egresses(ctx).await?;
        topics.sort_by_key(|t| t.topic_id);
        egresses.sort_by_key(|e| e.egress_id);
        Ok::<_, BusError>((topics, egresses))
    }
    .await;
    storage::finish(db, result).await
}
