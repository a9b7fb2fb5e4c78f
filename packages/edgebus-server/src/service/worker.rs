//! Background worker for queued and periodic tasks.
//!
//! Provides a generic `BackgroundWorker<R>` that processes tasks from a
//! bounded mpsc channel via a `BackgroundRunnable` implementation, with an
//! optional periodic tick. Tasks still queued when the worker is stopped are
//! drained before `BackgroundRunnable::shutdown` runs.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Task handler executed by `BackgroundWorker`.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    /// Process a single task.
    async fn run(&mut self, task: Self::Task);

    /// Called on each tick interval. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once after the queue is drained on stop. Default is a no-op.
    async fn shutdown(&mut self) {}
}

/// Why a task was not accepted by [`BackgroundWorker::try_submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("worker queue is full")]
    Full,
    #[error("worker is not running")]
    Stopped,
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Generic background worker that processes tasks via an mpsc channel.
///
/// All methods take `&self` so the worker can be shared behind an `Arc`.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Mutex<Option<mpsc::Sender<R::Task>>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Starts the worker with the given runnable, queue capacity, and tick
    /// interval.
    pub fn start(mut runnable: R, capacity: usize, tick_interval: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(capacity.max(1));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            // Skip the first immediate tick so on_tick doesn't fire at startup.
            ticker.tick().await;

            loop {
                tokio::select! {
                    task = rx.recv() => {
                        match task {
                            Some(t) => runnable.run(t).await,
                            None => break,
                        }
                    }
                    _ = ticker.tick() => {
                        runnable.on_tick().await;
                    }
                    _ = &mut shutdown_rx => {
                        rx.close();
                        while let Some(t) = rx.recv().await {
                            runnable.run(t).await;
                        }
                        break;
                    }
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Mutex::new(Some(tx)),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<R::Task>> {
        self.tx.lock().clone()
    }

    /// Submits a task, waiting for queue capacity.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match self.sender() {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("worker channel closed")),
            None => Err(anyhow::anyhow!("worker not running")),
        }
    }

    /// Submits a task without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError::Full`] when the queue is at capacity, or
    /// [`SubmitError::Stopped`] after [`stop`](Self::stop).
    pub fn try_submit(&self, task: R::Task) -> Result<(), SubmitError> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(SubmitError::Stopped);
        };
        tx.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubmitError::Full,
            mpsc::error::TrySendError::Closed(_) => SubmitError::Stopped,
        })
    }

    /// Stops the worker, waiting for queued tasks and `shutdown` to finish.
    /// Subsequent calls return immediately.
    pub async fn stop(&self) {
        self.tx.lock().take();
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Default, Clone)]
    struct Counters {
        runs: Arc<AtomicU32>,
        ticks: Arc<AtomicU32>,
        shutdowns: Arc<AtomicU32>,
    }

    struct CountingRunnable(Counters);

    #[async_trait]
    impl BackgroundRunnable for CountingRunnable {
        type Task = String;

        async fn run(&mut self, _task: String) {
            tokio::time::sleep(Duration::from_millis(1)).await;
            self.0.runs.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_tick(&mut self) {
            self.0.ticks.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.0.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn stop_drains_queued_tasks() {
        let counters = Counters::default();
        let worker =
            BackgroundWorker::start(CountingRunnable(counters.clone()), 16, Duration::from_secs(60));

        for i in 0..5 {
            worker.try_submit(format!("task-{i}")).unwrap();
        }
        worker.stop().await;

        assert_eq!(counters.runs.load(Ordering::SeqCst), 5);
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tick_fires_periodically() {
        let counters = Counters::default();
        let worker =
            BackgroundWorker::start(CountingRunnable(counters.clone()), 16, Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(100)).await;
        worker.stop().await;

        assert!(counters.ticks.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn submit_after_stop_is_rejected() {
        let worker =
            BackgroundWorker::start(CountingRunnable(Counters::default()), 16, Duration::from_secs(60));
        worker.stop().await;
        worker.stop().await;

        assert!(worker.submit("late".to_string()).await.is_err());
        assert_eq!(
            worker.try_submit("late".to_string()),
            Err(SubmitError::Stopped)
        );
    }
}
