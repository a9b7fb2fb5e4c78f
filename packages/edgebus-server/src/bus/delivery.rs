//! Delivery audit: observers notified of every delivery attempt outcome.
//!
//! Channels report each attempt to a [`DeliveryObserver`]. The
//! [`DeliveryRecorder`] persists attempts as `Delivery` records through a
//! background worker so the delivery tick never waits on storage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edgebus_core::DeliveryData;
use tracing::{debug, warn};

use crate::context::ExecutionContext;
use crate::service::registry::ManagedComponent;
use crate::service::worker::{BackgroundRunnable, BackgroundWorker, SubmitError};
use crate::traits::DatabaseFactory;

/// Observer of delivery attempt outcomes. Used as `Arc<dyn DeliveryObserver>`.
pub trait DeliveryObserver: Send + Sync {
    /// Called once per attempt, after the handlers of the attempt settled.
    fn on_delivery(&self, attempt: &DeliveryData);
}

/// Fans out notifications to multiple observers. An empty composite
/// discards everything.
#[derive(Default)]
pub struct CompositeDeliveryObserver {
    observers: Vec<Arc<dyn DeliveryObserver>>,
}

impl CompositeDeliveryObserver {
    #[must_use]
    pub fn new(observers: Vec<Arc<dyn DeliveryObserver>>) -> Self {
        Self { observers }
    }

    pub fn add(&mut self, observer: Arc<dyn DeliveryObserver>) {
        self.observers.push(observer);
    }
}

impl DeliveryObserver for CompositeDeliveryObserver {
    fn on_delivery(&self, attempt: &DeliveryData) {
        for observer in &self.observers {
            observer.on_delivery(attempt);
        }
    }
}

// ---------------------------------------------------------------------------
// DeliveryRecorder
// ---------------------------------------------------------------------------

struct DeliveryWriter {
    storage: Arc<dyn DatabaseFactory>,
    ctx: ExecutionContext,
}

impl DeliveryWriter {
    async fn write(&self, attempt: DeliveryData) -> anyhow::Result<()> {
        let mut db = self.storage.begin(&self.ctx).await?;
        let delivery = db.create_delivery(&self.ctx, attempt).await?;
        db.commit().await?;
        debug!(
            delivery_id = %delivery.delivery_id,
            status = delivery.data.status.as_str(),
            "delivery recorded"
        );
        Ok(())
    }
}

#[async_trait]
impl BackgroundRunnable for DeliveryWriter {
    type Task = DeliveryData;

    async fn run(&mut self, attempt: DeliveryData) {
        let message_id = attempt.message_id;
        if let Err(e) = self.write(attempt).await {
            warn!(message_id = %message_id, error = %e, "failed to record delivery");
        }
    }
}

/// Storage-backed audit observer.
///
/// Records are queued without blocking; when the queue is full the record is
/// dropped with a warning.
pub struct DeliveryRecorder {
    worker: BackgroundWorker<DeliveryWriter>,
}

impl DeliveryRecorder {
    /// Starts the writer task. Must be called inside a tokio runtime.
    #[must_use]
    pub fn start(storage: Arc<dyn DatabaseFactory>, capacity: usize) -> Self {
        let writer = DeliveryWriter {
            storage,
            ctx: ExecutionContext::with_correlation_id("delivery-recorder"),
        };
        Self {
            worker: BackgroundWorker::start(writer, capacity, Duration::from_secs(3600)),
        }
    }

    /// Flushes queued records and stops the writer.
    pub async fn stop(&self) {
        self.worker.stop().await;
    }
}

impl DeliveryObserver for DeliveryRecorder {
    fn on_delivery(&self, attempt: &DeliveryData) {
        match self.worker.try_submit(attempt.clone()) {
            Ok(()) => {}
            Err(SubmitError::Full) => {
                warn!(message_id = %attempt.message_id, "delivery audit queue full, record dropped");
            }
            Err(SubmitError::Stopped) => {
                debug!(message_id = %attempt.message_id, "delivery recorder stopped, record dropped");
            }
        }
    }
}

#[async_trait]
impl ManagedComponent for DeliveryRecorder {
    fn name(&self) -> &str {
        "delivery-recorder"
    }

    async fn init(&self, _ctx: &ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn dispose(&self) -> anyhow::Result<()> {
        self.stop().await;
        Ok(())
    }
}
