use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::context::ExecutionContext;

// ---------------------------------------------------------------------------
// ManagedComponent trait
// ---------------------------------------------------------------------------

/// A lifecycle-managed runtime peer: the bus engine, egress adapters,
/// the delivery recorder.
///
/// Components receive their dependencies through their constructors; the
/// registry only sequences `init` and `dispose`.
#[async_trait]
pub trait ManagedComponent: Send + Sync {
    /// Unique name used in logs (e.g., `"message-bus"`, `"egress.webhook"`).
    fn name(&self) -> &str;

    async fn init(&self, ctx: &ExecutionContext) -> anyhow::Result<()>;

    /// Releases resources acquired by `init`. Must be safe to call once after
    /// a successful `init`.
    async fn dispose(&self) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

/// Explicit, ordered list of lifecycle peers.
///
/// Components are initialized in registration order and disposed in reverse
/// order. If an `init` fails, every component initialized before it is
/// disposed (in reverse) and the error is returned.
#[derive(Default)]
pub struct ComponentRegistry {
    components: RwLock<Vec<Arc<dyn ManagedComponent>>>,
    initialized: RwLock<usize>,
}

impl ComponentRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a component. Registration order determines init order.
    pub fn register(&self, component: Arc<dyn ManagedComponent>) {
        self.components.write().push(component);
    }

    /// Names in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.components
            .read()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Initializes all registered components in registration order.
    ///
    /// # Errors
    ///
    /// Returns the first `init` failure, after disposing the components that
    /// were already initialized.
    pub async fn init_all(&self, ctx: &ExecutionContext) -> anyhow::Result<()> {
        let components = self.components.read().clone();
        for component in &components {
            info!(component = component.name(), "initializing");
            if let Err(e) = component.init(ctx).await {
                warn!(component = component.name(), error = %e, "initialization failed, rolling back");
                self.dispose_all().await?;
                return Err(e);
            }
            *self.initialized.write() += 1;
        }
        Ok(())
    }

    /// Disposes every initialized component in reverse registration order.
    ///
    /// All components are visited even if some fail.
    ///
    /// # Errors
    ///
    /// Returns the first `dispose` failure.
    pub async fn dispose_all(&self) -> anyhow::Result<()> {
        let count = std::mem::take(&mut *self.initialized.write());
        let components: Vec<_> = self.components.read()[..count].to_vec();

        let mut first_error = None;
        for component in components.iter().rev() {
            info!(component = component.name(), "disposing");
            if let Err(e) = component.dispose().await {
                warn!(component = component.name(), error = %e, "dispose failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
