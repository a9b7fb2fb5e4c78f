//! Error taxonomy for the bus engine, label handlers, and external processes.

use std::fmt;

use edgebus_core::{IdentifierError, LabelHandlerId};

/// Failure classes of one external-process label handler invocation.
#[derive(Debug, thiserror::Error)]
pub enum ExternalProcessError {
    #[error("cannot spawn external process {path}: {reason}")]
    CannotSpawn { path: String, reason: String },
    #[error("external process {path} timed out after {timeout_ms}ms")]
    Timeout { path: String, timeout_ms: u64 },
    #[error("external process {path} exited with unexpected code {code}")]
    UnexpectedExitCode {
        path: String,
        code: i32,
        stderr: String,
    },
    #[error("external process {path} was killed")]
    Killed { path: String },
    #[error("parse error: expected JSON array of strings from external process {path}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("I/O failure while talking to external process {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("external process {path} cancelled")]
    Cancelled { path: String },
}

/// A label handler failure, tagged with the handler that produced it.
#[derive(Debug, thiserror::Error)]
pub enum LabelsHandlerError {
    #[error("label handler {handler_id}: {source}")]
    ExternalProcess {
        handler_id: LabelHandlerId,
        #[source]
        source: ExternalProcessError,
    },
}

/// Every label handler failure collected during a single publish.
#[derive(Debug)]
pub struct AggregateError {
    pub failures: Vec<LabelsHandlerError>,
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} label handler(s) failed", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; {failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

/// Errors surfaced by the message bus and egress adapters.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("bad argument '{name}': {message}")]
    Argument { name: &'static str, message: String },
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    #[error("operation cancelled")]
    Cancelled,
    #[error("storage failure: {0}")]
    Storage(#[from] anyhow::Error),
}

impl BusError {
    /// Builds an `Argument` error from an identifier parse failure.
    #[must_use]
    pub fn identifier(name: &'static str, err: &IdentifierError) -> Self {
        Self::Argument {
            name,
            message: err.to_string(),
        }
    }
}
