//! Execution context threaded through every bus operation.

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-call context carrying a cancellation signal and a correlation id.
///
/// Cloning is cheap; clones share the same cancellation token.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    token: CancellationToken,
    correlation_id: String,
}

impl ExecutionContext {
    /// Creates a root context with a fresh correlation id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    /// Creates a root context with the given correlation id (e.g. a request id).
    #[must_use]
    pub fn with_correlation_id(correlation_id: impl Into<String>) -> Self {
        Self {
            token: CancellationToken::new(),
            correlation_id: correlation_id.into(),
        }
    }

    /// Derives a context that is cancelled when this one is, but can also be
    /// cancelled on its own.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            correlation_id: self.correlation_id.clone(),
        }
    }

    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the context is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}
