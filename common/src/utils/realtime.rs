use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use crate::{error::AppError, storage::types::document::DocumentStatus};

/// Progress snapshot pushed to the owning user while a document moves
/// through the pipeline.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub document_id: String,
    pub status: DocumentStatus,
    pub stage: String,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Best-effort push channel. Callers must treat failures as non-fatal: a
/// lost notification never fails the pipeline.
#[async_trait]
pub trait RealtimeNotifier: Send + Sync {
    async fn notify(&self, tenant_id: &str, update: StatusUpdate) -> Result<(), AppError>;
}

/// Default notifier that only records the update in the log stream.
pub struct LogNotifier;

#[async_trait]
impl RealtimeNotifier for LogNotifier {
    async fn notify(&self, tenant_id: &str, update: StatusUpdate) -> Result<(), AppError> {
        info!(
            tenant_id,
            document_id = %update.document_id,
            status = update.status.as_str(),
            stage = %update.stage,
            progress = update.progress,
            error = update.error.as_deref(),
            "document status update"
        );
        Ok(())
    }
}
