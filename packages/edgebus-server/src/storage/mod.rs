//! Storage gateway implementations and helpers.
//!
//! The gateway contract itself ([`DatabaseFactory`](crate::traits::DatabaseFactory)
//! and [`Database`](crate::traits::Database)) lives in `traits`. This module
//! provides the shared error type, the unit-of-work completion helper, and
//! the in-memory backend.

pub mod memory;

pub use memory::{InMemoryDatabaseFactory, MemorySeed};

use tracing::warn;

use crate::error::BusError;
use crate::traits::Database;

/// Errors raised by storage backends, carried inside `anyhow::Error`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("no such {entity}: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("{entity} {id} already exists")]
    Conflict { entity: &'static str, id: String },
    #[error("transaction cancelled")]
    Cancelled,
}

/// Completes a unit of work: commits when `result` is `Ok`, rolls back otherwise.
///
/// A rollback failure is logged and the original error is returned.
///
/// # Errors
///
/// Returns the error carried by `result`, or the commit failure.
pub async fn finish<T>(db: Box<dyn Database>, result: Result<T, BusError>) -> Result<T, BusError> {
    match result {
        Ok(value) => {
            db.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = db.rollback().await {
                warn!(error = %rollback_err, "transaction rollback failed");
            }
            Err(err)
        }
    }
}

/// Returns the [`StorageError`] inside an `anyhow` chain, if any.
#[must_use]
pub fn storage_error(err: &anyhow::Error) -> Option<&StorageError> {
    err.downcast_ref::<StorageError>()
}
