use std::sync::Arc;

use async_trait::async_trait;
use broker::{MessageHandler, MessagePublisher};
use common::messages::{TranscribeRequestMessage, UploadMessage};
use tracing::info;

use crate::pipeline::{requires_transcription, DocumentProcessor};

/// Binds `UploadMessage` to the document processor. This is the fire-once
/// pipeline entry: a parse failure surfaces immediately as a rejected
/// delivery, with no retry wrapper. Audio and video uploads are handed to
/// the external transcription worker instead of the parse stage.
pub struct UploadHandler {
    processor: Arc<DocumentProcessor>,
    publisher: Arc<dyn MessagePublisher>,
    transcribe_request_routing_key: String,
}

impl UploadHandler {
    pub fn new(
        processor: Arc<DocumentProcessor>,
        publisher: Arc<dyn MessagePublisher>,
        transcribe_request_routing_key: impl Into<String>,
    ) -> Self {
        Self {
            processor,
            publisher,
            transcribe_request_routing_key: transcribe_request_routing_key.into(),
        }
    }
}

#[async_trait]
impl MessageHandler for UploadHandler {
    type Message = UploadMessage;

    async fn handle(&self, message: UploadMessage) -> anyhow::Result<()> {
        if requires_transcription(&message.content_type) {
            let request = TranscribeRequestMessage::from_upload(&message);
            let payload = serde_json::to_vec(&request)?;
            self.publisher
                .publish_bytes(&self.transcribe_request_routing_key, payload)
                .await?;
            info!(
                document_id = %message.document_id,
                content_type = %message.content_type,
                "dispatched document for transcription"
            );
            return Ok(());
        }

        self.processor
            .process_document(&message.document_id)
            .await?;
        Ok(())
    }
}
