//! Label handlers: pluggable computations that derive labels from a message
//! before it is persisted.

pub mod external_process;

use std::sync::Arc;

use async_trait::async_trait;
use edgebus_core::{LabelHandler, LabelHandlerId, LabelHandlerKind, MessageData, TopicId};
use tracing::debug;

pub use external_process::{ExternalProcess, ExternalProcessConfig};

use crate::context::ExecutionContext;
use crate::error::{BusError, LabelsHandlerError};

/// Computes zero or more label values for a message.
#[async_trait]
pub trait LabelsHandler: Send + Sync {
    fn handler_id(&self) -> LabelHandlerId;

    fn topic_id(&self) -> TopicId;

    /// Returns label values; duplicates are allowed and collapsed by the bus.
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        message: &MessageData,
    ) -> Result<Vec<String>, LabelsHandlerError>;
}

/// Runs an external executable per message, writing the transformed body
/// to its stdin.
pub struct ExternalProcessLabelsHandler {
    handler_id: LabelHandlerId,
    topic_id: TopicId,
    process: ExternalProcess,
}

impl ExternalProcessLabelsHandler {
    #[must_use]
    pub fn new(handler_id: LabelHandlerId, topic_id: TopicId, process: ExternalProcess) -> Self {
        Self {
            handler_id,
            topic_id,
            process,
        }
    }
}

#[async_trait]
impl LabelsHandler for ExternalProcessLabelsHandler {
    fn handler_id(&self) -> LabelHandlerId {
        self.handler_id
    }

    fn topic_id(&self) -> TopicId {
        self.topic_id
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        message: &MessageData,
    ) -> Result<Vec<String>, LabelsHandlerError> {
        self.process
            .execute(ctx, &message.transformed_body)
            .await
            .map_err(|source| LabelsHandlerError::ExternalProcess {
                handler_id: self.handler_id,
                source,
            })
    }
}

/// Builds a runtime handler from its stored description.
///
/// # Errors
///
/// Returns [`BusError::InvalidOperation`] for a handler kind this build does
/// not know how to run.
pub fn build_labels_handler(
    record: &LabelHandler,
    config: &ExternalProcessConfig,
) -> Result<Arc<dyn LabelsHandler>, BusError> {
    match &record.kind {
        LabelHandlerKind::ExternalProcess {
            external_process_path,
        } => {
            let executable = config.resolve(external_process_path);
            debug!(
                handler_id = %record.label_handler_id,
                executable = %executable.display(),
                "label handler configured"
            );
            let process =
                ExternalProcess::new(executable, config.spawn_timeout, config.execution_timeout);
            Ok(Arc::new(ExternalProcessLabelsHandler::new(
                record.label_handler_id,
                record.topic_id,
                process,
            )))
        }
        other => Err(BusError::InvalidOperation(format!(
            "unsupported label handler kind: {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_process_record_resolves_under_handlers_dir() {
        let record = LabelHandler {
            label_handler_id: LabelHandlerId::generate(),
            topic_id: TopicId::generate(),
            kind: LabelHandlerKind::ExternalProcess {
                external_process_path: "gitlab.sh".to_string(),
            },
        };
        let config = ExternalProcessConfig {
            handlers_dir: "/srv/handlers".into(),
            ..ExternalProcessConfig::default()
        };
        let handler = build_labels_handler(&record, &config).unwrap();
        assert_eq!(handler.handler_id(), record.label_handler_id);
        assert_eq!(handler.topic_id(), record.topic_id);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failure_is_tagged_with_handler_id() {
        let handler_id = LabelHandlerId::generate();
        let handler = ExternalProcessLabelsHandler::new(
            handler_id,
            TopicId::generate(),
            ExternalProcess::new(
                "/bin/sh",
                std::time::Duration::from_secs(5),
                std::time::Duration::from_secs(5),
            )
            .with_args(["-c", "exit 2"]),
        );
        let message = MessageData {
            message_id: edgebus_core::MessageId::generate(),
            headers: std::collections::BTreeMap::new(),
            media_type: "application/json".to_string(),
            ingress_body: bytes::Bytes::from_static(b"{}"),
            transformed_body: bytes::Bytes::from_static(b"{}"),
        };
        let err = handler
            .execute(&ExecutionContext::new(), &message)
            .await
            .unwrap_err();
        let LabelsHandlerError::ExternalProcess { handler_id: id, .. } = err;
        assert_eq!(id, handler_id);
    }
}
