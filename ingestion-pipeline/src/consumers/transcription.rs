use std::sync::Arc;

use async_trait::async_trait;
use broker::{MessageHandler, MessagePublisher};
use common::{
    error::AppError,
    messages::{TranscribeCompletedMessage, TranscriptionStatus},
    storage::{
        documents::DocumentRepository,
        store::StorageManager,
        types::document::{truncate_error, Document, DocumentStatus},
    },
    utils::realtime::{RealtimeNotifier, StatusUpdate},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    pipeline::DocumentProcessor,
    retry::{RetryOutcome, RetryPolicy},
};

/// Binds `TranscribeCompletedMessage` to the pipeline's resume point. A
/// failed or timed-out transcription settles the document immediately;
/// a successful one stores the transcript as document content and runs
/// chunk/embed/index under the retry policy, republishing the same message
/// unchanged when another attempt is warranted.
pub struct TranscriptionHandler {
    processor: Arc<DocumentProcessor>,
    repository: Arc<dyn DocumentRepository>,
    storage: StorageManager,
    publisher: Arc<dyn MessagePublisher>,
    notifier: Arc<dyn RealtimeNotifier>,
    retry_policy: RetryPolicy,
    completed_routing_key: String,
    shutdown: CancellationToken,
}

impl TranscriptionHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        processor: Arc<DocumentProcessor>,
        repository: Arc<dyn DocumentRepository>,
        storage: StorageManager,
        publisher: Arc<dyn MessagePublisher>,
        notifier: Arc<dyn RealtimeNotifier>,
        retry_policy: RetryPolicy,
        completed_routing_key: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            processor,
            repository,
            storage,
            publisher,
            notifier,
            retry_policy,
            completed_routing_key: completed_routing_key.into(),
            shutdown,
        }
    }

    async fn mark_failed(
        &self,
        document: &Document,
        stage: &str,
        reason: String,
    ) -> Result<(), AppError> {
        let message = truncate_error(&reason);
        self.repository
            .update_status(
                &document.tenant_id,
                &document.id,
                DocumentStatus::Failed,
                Some(message.clone()),
            )
            .await?;

        let update = StatusUpdate {
            document_id: document.id.clone(),
            status: DocumentStatus::Failed,
            stage: stage.to_owned(),
            progress: 0,
            error: Some(message),
        };
        if let Err(err) = self.notifier.notify(&document.tenant_id, update).await {
            warn!(
                document_id = %document.id,
                error = %err,
                "realtime notification failed"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for TranscriptionHandler {
    type Message = TranscribeCompletedMessage;

    async fn handle(&self, message: TranscribeCompletedMessage) -> anyhow::Result<()> {
        let Some(document) = self.repository.get(&message.document_id).await? else {
            debug!(
                document_id = %message.document_id,
                "document not found for transcription result; skipping"
            );
            return Ok(());
        };
        if document.status.is_terminal() {
            info!(document_id = %document.id, "document already indexed; nothing to do");
            return Ok(());
        }

        match message.status {
            TranscriptionStatus::Failed | TranscriptionStatus::Timeout => {
                let reason = message.error.clone().unwrap_or_else(|| {
                    format!("transcription {}", message.status.as_str().to_lowercase())
                });
                self.mark_failed(&document, "transcribe", reason).await?;
                return Ok(());
            }
            TranscriptionStatus::Success => {}
        }

        let transcript = self
            .storage
            .get(&message.transcribed_text_object_key)
            .await
            .map_err(AppError::from)?;
        let Ok(text) = String::from_utf8(transcript.to_vec()) else {
            self.mark_failed(
                &document,
                "transcribe",
                "transcribed text is not valid UTF-8".to_owned(),
            )
            .await?;
            return Ok(());
        };

        self.repository
            .store_content(&document.tenant_id, &document.id, text)
            .await?;
        self.repository
            .update_status(
                &document.tenant_id,
                &document.id,
                DocumentStatus::Parsed,
                None,
            )
            .await?;

        let outcome = self
            .retry_policy
            .execute(
                &document.id,
                document.retry_count,
                &self.shutdown,
                || self.processor.resume_indexing(&document.id),
                || async {
                    // The retry counter lives on the document record so the
                    // next delivery sees how much budget is left.
                    self.repository
                        .record_retry(&document.tenant_id, &document.id)
                        .await?;
                    self.publisher
                        .publish_bytes(&self.completed_routing_key, serde_json::to_vec(&message)?)
                        .await?;
                    Ok(())
                },
            )
            .await;

        match outcome {
            RetryOutcome::Success => Ok(()),
            RetryOutcome::WillRetry => {
                info!(
                    document_id = %document.id,
                    retry_count = document.retry_count,
                    "indexing attempt failed; retry scheduled"
                );
                Ok(())
            }
            RetryOutcome::MaxRetriesExceeded => {
                self.mark_failed(
                    &document,
                    "index",
                    format!(
                        "indexing retries exhausted after {} attempts",
                        self.retry_policy.max_retry_count
                    ),
                )
                .await?;
                Ok(())
            }
            RetryOutcome::Failed => {
                let exhausted = document.retry_count.saturating_add(1)
                    >= self.retry_policy.max_retry_count;
                let reason = if exhausted {
                    format!(
                        "indexing failed; retry budget of {} attempts exhausted",
                        self.retry_policy.max_retry_count
                    )
                } else {
                    "indexing failed with a non-retryable error".to_owned()
                };
                self.mark_failed(&document, "index", reason).await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use bytes::Bytes;
    use chrono::Utc;
    use common::{
        storage::documents::InMemoryDocumentRepository,
        utils::realtime::LogNotifier,
    };

    use super::*;
    use crate::consumers::testing::{harness, seed_document, RecordingPublisher, TestHarness};
    use crate::pipeline::PipelineServices;

    const TRANSCRIPT_KEY: &str = "tenant-1/doc/transcript.txt";

    fn completed_message(document_id: &str, status: TranscriptionStatus) -> TranscribeCompletedMessage {
        TranscribeCompletedMessage {
            document_id: document_id.to_owned(),
            transcribed_text_object_key: TRANSCRIPT_KEY.to_owned(),
            provider: Some("whisper".to_owned()),
            duration_ms: Some(1_200),
            status,
            error: None,
            created_at: Utc::now(),
        }
    }

    fn handler_for(
        harness: &TestHarness,
        publisher: Arc<RecordingPublisher>,
        retry_policy: RetryPolicy,
    ) -> TranscriptionHandler {
        TranscriptionHandler::new(
            Arc::clone(&harness.processor),
            Arc::clone(&harness.repository) as Arc<dyn DocumentRepository>,
            harness.storage.clone(),
            publisher,
            Arc::new(LogNotifier),
            retry_policy,
            "document.transcribe.completed",
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn successful_transcription_indexes_the_document() {
        let harness = harness();
        let document = seed_document(
            &harness.repository,
            "audio/mpeg",
            "tenant-1/doc/meeting.mp3",
        )
        .await;
        harness
            .storage
            .put(
                TRANSCRIPT_KEY,
                Bytes::from_static(b"Minutes of the weekly planning meeting."),
            )
            .await
            .expect("transcript stored");

        let publisher = Arc::new(RecordingPublisher::new());
        let handler = handler_for(&harness, publisher.clone(), RetryPolicy::new(3, 0, false));

        handler
            .handle(completed_message(&document.id, TranscriptionStatus::Success))
            .await
            .expect("handled");

        let stored = harness
            .repository
            .get(&document.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(stored.status, DocumentStatus::Indexed);
        assert_eq!(stored.retry_count, 0);
        assert_eq!(
            stored.content.as_deref(),
            Some("Minutes of the weekly planning meeting.")
        );
        assert_eq!(publisher.count().await, 0);
    }

    #[tokio::test]
    async fn failed_transcription_settles_without_retry() {
        let harness = harness();
        let document = seed_document(
            &harness.repository,
            "audio/mpeg",
            "tenant-1/doc/meeting.mp3",
        )
        .await;

        let publisher = Arc::new(RecordingPublisher::new());
        let handler = handler_for(&harness, publisher.clone(), RetryPolicy::new(3, 0, false));

        let mut message = completed_message(&document.id, TranscriptionStatus::Failed);
        message.error = Some("asr timeout".to_owned());

        handler.handle(message).await.expect("handled");

        let stored = harness
            .repository
            .get(&document.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(stored.status, DocumentStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("asr timeout"));
        assert_eq!(stored.retry_count, 0);
        assert_eq!(publisher.count().await, 0);
    }

    #[tokio::test]
    async fn timeout_without_a_supplied_error_gets_a_default_reason() {
        let harness = harness();
        let document = seed_document(
            &harness.repository,
            "audio/mpeg",
            "tenant-1/doc/meeting.mp3",
        )
        .await;

        let publisher = Arc::new(RecordingPublisher::new());
        let handler = handler_for(&harness, publisher, RetryPolicy::new(3, 0, false));

        handler
            .handle(completed_message(&document.id, TranscriptionStatus::Timeout))
            .await
            .expect("handled");

        let stored = harness
            .repository
            .get(&document.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(stored.status, DocumentStatus::Failed);
        assert_eq!(
            stored.error_message.as_deref(),
            Some("transcription timeout")
        );
    }

    /// Services whose indexing fails a configurable number of times before
    /// succeeding, for driving the retry ladder.
    struct FlakyIndexServices {
        failures: u32,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl PipelineServices for FlakyIndexServices {
        async fn load_source(&self, _document: &Document) -> Result<Bytes, AppError> {
            unreachable!("transcription resume never reloads the source")
        }

        async fn parse_text(
            &self,
            _document: &Document,
            _source: Bytes,
        ) -> Result<String, AppError> {
            unreachable!("transcription resume never re-parses")
        }

        fn chunk_text(&self, text: &str) -> Result<Vec<String>, AppError> {
            Ok(vec![text.to_owned()])
        }

        async fn embed_chunks(&self, chunks: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
            Ok(chunks.iter().map(|_| vec![0.5; 4]).collect())
        }

        async fn index_chunks(
            &self,
            _document: &Document,
            chunks: &[String],
            _embeddings: Vec<Vec<f32>>,
        ) -> Result<usize, AppError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(AppError::Processing("embedding service error".to_owned()));
            }
            Ok(chunks.len())
        }
    }

    struct RetryHarness {
        repository: Arc<InMemoryDocumentRepository>,
        storage: StorageManager,
        handler: TranscriptionHandler,
        publisher: Arc<RecordingPublisher>,
    }

    fn retry_harness(failures: u32) -> RetryHarness {
        let repository = Arc::new(InMemoryDocumentRepository::new());
        let storage = StorageManager::memory();
        let services = Arc::new(FlakyIndexServices {
            failures,
            attempts: AtomicU32::new(0),
        });
        let processor = Arc::new(DocumentProcessor::new(
            Arc::clone(&repository) as Arc<dyn DocumentRepository>,
            services,
            Arc::new(LogNotifier),
        ));
        let publisher = Arc::new(RecordingPublisher::new());
        let handler = TranscriptionHandler::new(
            processor,
            Arc::clone(&repository) as Arc<dyn DocumentRepository>,
            storage.clone(),
            publisher.clone(),
            Arc::new(LogNotifier),
            RetryPolicy::new(3, 0, false),
            "document.transcribe.completed",
            CancellationToken::new(),
        );

        RetryHarness {
            repository,
            storage,
            handler,
            publisher,
        }
    }

    /// Replays broker redeliveries: each republished message becomes the
    /// next `handle` call, exactly as the completed queue would deliver it.
    async fn drive_redeliveries(
        harness: &RetryHarness,
        first: TranscribeCompletedMessage,
        max_deliveries: usize,
    ) -> usize {
        let mut deliveries = 0;
        let mut delivered_up_to = 0;
        let mut next = Some(first);

        while let Some(message) = next.take() {
            deliveries += 1;
            harness.handler.handle(message).await.expect("handled");

            let published = harness.publisher.published.lock().await;
            if published.len() > delivered_up_to && deliveries < max_deliveries {
                let (_, payload) = &published[delivered_up_to];
                delivered_up_to += 1;
                next = Some(serde_json::from_slice(payload).expect("republished decodes"));
            }
        }
        deliveries
    }

    #[tokio::test]
    async fn two_failures_then_success_reaches_indexed() {
        let harness = retry_harness(2);
        let document = Document::new(
            "tenant-1",
            "kb-1",
            "meeting.mp3",
            "audio/mpeg",
            "tenant-1/doc/meeting.mp3",
        );
        harness
            .repository
            .insert(document.clone())
            .await
            .expect("seeded");
        harness
            .storage
            .put(TRANSCRIPT_KEY, Bytes::from_static(b"transcript text"))
            .await
            .expect("transcript stored");

        let deliveries = drive_redeliveries(
            &harness,
            completed_message(&document.id, TranscriptionStatus::Success),
            10,
        )
        .await;

        assert_eq!(deliveries, 3);
        assert_eq!(harness.publisher.count().await, 2);

        let stored = harness
            .repository
            .get(&document.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(stored.status, DocumentStatus::Indexed);
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn persistent_failure_exhausts_the_budget_and_settles_failed() {
        let harness = retry_harness(u32::MAX);
        let document = Document::new(
            "tenant-1",
            "kb-1",
            "meeting.mp3",
            "audio/mpeg",
            "tenant-1/doc/meeting.mp3",
        );
        harness
            .repository
            .insert(document.clone())
            .await
            .expect("seeded");
        harness
            .storage
            .put(TRANSCRIPT_KEY, Bytes::from_static(b"transcript text"))
            .await
            .expect("transcript stored");

        let deliveries = drive_redeliveries(
            &harness,
            completed_message(&document.id, TranscriptionStatus::Success),
            10,
        )
        .await;

        // Three attempts total, two republishes, then the budget is gone.
        assert_eq!(deliveries, 3);
        assert_eq!(harness.publisher.count().await, 2);

        let stored = harness
            .repository
            .get(&document.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(stored.status, DocumentStatus::Failed);
        assert_eq!(stored.retry_count, 2);
        let message = stored.error_message.expect("error recorded");
        assert!(message.contains("exhausted"));
    }

    #[tokio::test]
    async fn missing_document_is_skipped() {
        let harness = retry_harness(0);
        harness
            .handler
            .handle(completed_message("ghost", TranscriptionStatus::Success))
            .await
            .expect("skipped");
        assert_eq!(harness.publisher.count().await, 0);
    }
}
