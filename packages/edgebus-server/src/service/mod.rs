//! Runtime plumbing shared by bus components.
//!
//! - `registry`: ordered init/dispose of lifecycle peers
//! - `worker`: queued background tasks

pub mod registry;
pub mod worker;

pub use registry::{ComponentRegistry, ManagedComponent};
pub use worker::{BackgroundRunnable, BackgroundWorker, SubmitError};
