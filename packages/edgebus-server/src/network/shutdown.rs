//! Server lifecycle state and in-flight publish tracking.
//!
//! Health checks read the state from an `ArcSwap` without locking. Every ingress
//! publish holds an [`InFlightGuard`]; the last guard to drop after shutdown
//! wakes [`ShutdownController::wait_for_drain`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::Notify;

/// Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Components are initializing; ingress is closed.
    Starting,
    /// Accepting publishes and consumers.
    Ready,
    /// Shutdown requested; in-flight publishes are finishing.
    Draining,
    Stopped,
}

impl HealthState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicU64,
    drained: Notify,
}

/// Gates ingress and consumer admission on the server state and tracks
/// publishes still running.
#[derive(Debug)]
pub struct ShutdownController {
    state: ArcSwap<HealthState>,
    in_flight: Arc<InFlight>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(HealthState::Starting),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn set_ready(&self) {
        self.state.store(Arc::new(HealthState::Ready));
    }

    /// Stops admitting publishes and consumers.
    pub fn trigger_shutdown(&self) {
        self.state.store(Arc::new(HealthState::Draining));
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.state.load()
    }

    /// Whether new publishes and consumer sessions may start.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.health_state() == HealthState::Ready
    }

    /// Counts one publish until the guard drops.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Waits up to `timeout` for every guard to drop.
    ///
    /// Moves to `Stopped` and returns `true` once drained; stays `Draining`
    /// and returns `false` on timeout.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.in_flight.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.in_flight_count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(timeout, drained).await.is_err() {
            return false;
        }
        self.state.store(Arc::new(HealthState::Stopped));
        true
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases one in-flight slot on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.in_flight.drained.notify_waiters();
        }
    }
}
