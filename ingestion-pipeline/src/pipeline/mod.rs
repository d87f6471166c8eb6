mod services;
mod state;

pub use services::{
    requires_transcription, DefaultPipelineServices, PipelineServices, PipelineTuning,
};

use std::sync::Arc;

use common::{
    error::AppError,
    storage::{
        documents::DocumentRepository,
        types::document::{truncate_error, Document, DocumentStatus},
    },
    utils::realtime::{RealtimeNotifier, StatusUpdate},
};
use state_machines::core::GuardError;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use self::state::ProcessingMachine;

/// Outcome classification for a processing attempt. The retry policy only
/// looks at this split and never re-inspects the underlying error.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Retryable(AppError),
    #[error(transparent)]
    Permanent(AppError),
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Retryable(_))
    }

    pub fn into_inner(self) -> AppError {
        match self {
            PipelineError::Retryable(err) | PipelineError::Permanent(err) => err,
        }
    }
}

fn classify(err: AppError) -> PipelineError {
    match err {
        AppError::Validation(_) | AppError::NotFound(_) => PipelineError::Permanent(err),
        _ => PipelineError::Retryable(err),
    }
}

/// Drives a document through `Uploaded -> Parsing -> Parsed -> Indexing ->
/// Indexed`, persisting every transition, or settles it in `Failed` with a
/// truncated error. Deliberately free of broker types so a consumer handler
/// and a polling backlog job call the exact same function.
pub struct DocumentProcessor {
    repository: Arc<dyn DocumentRepository>,
    services: Arc<dyn PipelineServices>,
    notifier: Arc<dyn RealtimeNotifier>,
}

impl DocumentProcessor {
    pub fn new(
        repository: Arc<dyn DocumentRepository>,
        services: Arc<dyn PipelineServices>,
        notifier: Arc<dyn RealtimeNotifier>,
    ) -> Self {
        Self {
            repository,
            services,
            notifier,
        }
    }

    #[instrument(skip_all, fields(document_id = %document_id))]
    pub async fn process_document(&self, document_id: &str) -> Result<(), PipelineError> {
        let Some(document) = self.load(document_id).await? else {
            return Ok(());
        };
        if document.status.is_terminal() {
            info!(document_id, "document already indexed; nothing to do");
            return Ok(());
        }

        match self.run_from_upload(&document).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.settle_failure(&document, err).await),
        }
    }

    /// Resume point after external transcription: the document's content is
    /// already stored, only chunk/embed/index remain.
    #[instrument(skip_all, fields(document_id = %document_id))]
    pub async fn resume_indexing(&self, document_id: &str) -> Result<(), PipelineError> {
        let Some(document) = self.load(document_id).await? else {
            return Ok(());
        };
        if document.status.is_terminal() {
            info!(document_id, "document already indexed; nothing to do");
            return Ok(());
        }

        let Some(content) = document.content.clone() else {
            let err = AppError::Validation("document has no stored content to index".to_owned());
            return Err(self.settle_failure(&document, err).await);
        };

        match self.run_indexing(&document, &content, state::parsed()).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.settle_failure(&document, err).await),
        }
    }

    /// Alternate entry for a polling batch job sweeping the `Uploaded`
    /// backlog; returns how many documents reached a clean finish.
    pub async fn process_uploaded_backlog(&self, limit: usize) -> Result<usize, AppError> {
        let backlog = self
            .repository
            .list_by_status(DocumentStatus::Uploaded, limit)
            .await?;
        let total = backlog.len();

        let mut processed = 0;
        for document in backlog {
            match self.process_document(&document.id).await {
                Ok(()) => processed += 1,
                Err(err) => {
                    warn!(document_id = %document.id, error = %err, "backlog document failed")
                }
            }
        }

        if total > 0 {
            info!(total, processed, "uploaded backlog sweep finished");
        }
        Ok(processed)
    }

    async fn load(&self, document_id: &str) -> Result<Option<Document>, PipelineError> {
        match self.repository.get(document_id).await {
            Ok(Some(document)) => Ok(Some(document)),
            Ok(None) => {
                // Already deleted or foreign tenant; not an error.
                debug!(document_id, "document not found; skipping");
                Ok(None)
            }
            Err(err) => Err(classify(err)),
        }
    }

    async fn run_from_upload(&self, document: &Document) -> Result<(), AppError> {
        let machine = state::ready();

        self.persist_status(document, DocumentStatus::Parsing, "parse", 10)
            .await?;
        let source = self.services.load_source(document).await?;
        let text = self.services.parse_text(document, source).await?;
        self.repository
            .store_content(&document.tenant_id, &document.id, text.clone())
            .await?;
        self.persist_status(document, DocumentStatus::Parsed, "parse", 40)
            .await?;
        let machine = machine
            .parse()
            .map_err(|(_, guard)| map_guard_error("parse", &guard))?;

        self.run_indexing(document, &text, machine).await
    }

    async fn run_indexing(
        &self,
        document: &Document,
        text: &str,
        machine: ProcessingMachine<(), state::Parsed>,
    ) -> Result<(), AppError> {
        let chunks = self.services.chunk_text(text)?;
        let embeddings = self.services.embed_chunks(&chunks).await?;
        let machine = machine
            .embed()
            .map_err(|(_, guard)| map_guard_error("embed", &guard))?;

        self.persist_status(document, DocumentStatus::Indexing, "embed", 70)
            .await?;
        let chunk_count = self
            .services
            .index_chunks(document, &chunks, embeddings)
            .await?;
        let _machine = machine
            .index()
            .map_err(|(_, guard)| map_guard_error("index", &guard))?;

        self.persist_status(document, DocumentStatus::Indexed, "index", 100)
            .await?;
        self.repository
            .reset_retries(&document.tenant_id, &document.id)
            .await?;

        info!(document_id = %document.id, chunk_count, "document indexed");
        Ok(())
    }

    async fn persist_status(
        &self,
        document: &Document,
        status: DocumentStatus,
        stage: &str,
        progress: u8,
    ) -> Result<(), AppError> {
        self.repository
            .update_status(&document.tenant_id, &document.id, status.clone(), None)
            .await?;
        self.notify(document, status, stage, progress, None).await;
        Ok(())
    }

    /// Records `Failed` with a truncated message, then re-raises classified
    /// so the caller (retry policy or consumer) decides the outcome.
    async fn settle_failure(&self, document: &Document, err: AppError) -> PipelineError {
        let message = truncate_error(&err.to_string());
        if let Err(persist_err) = self
            .repository
            .update_status(
                &document.tenant_id,
                &document.id,
                DocumentStatus::Failed,
                Some(message.clone()),
            )
            .await
        {
            warn!(
                document_id = %document.id,
                error = %persist_err,
                "failed to persist failure status"
            );
        }
        self.notify(document, DocumentStatus::Failed, "failed", 0, Some(message))
            .await;
        classify(err)
    }

    async fn notify(
        &self,
        document: &Document,
        status: DocumentStatus,
        stage: &str,
        progress: u8,
        error: Option<String>,
    ) {
        let update = StatusUpdate {
            document_id: document.id.clone(),
            status,
            stage: stage.to_owned(),
            progress,
            error,
        };
        // Best effort only; a lost notification never fails the pipeline.
        if let Err(err) = self.notifier.notify(&document.tenant_id, update).await {
            warn!(
                document_id = %document.id,
                error = %err,
                "realtime notification failed"
            );
        }
    }
}

fn map_guard_error(event: &str, guard: &GuardError) -> AppError {
    AppError::InternalError(format!(
        "invalid processing transition during {event}: {guard:?}"
    ))
}
