use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Published when a freshly stored file is waiting for the parse stage.
/// Immutable once published; consumers must not rewrite its fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadMessage {
    pub document_id: String,
    pub knowledge_base_id: String,
    pub object_key: String,
    pub file_name: String,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
}

/// Request handed to the external transcription worker for audio/video
/// uploads. Consumed outside this process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TranscribeRequestMessage {
    pub document_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_base_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub object_key: String,
    pub file_name: String,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TranscribeRequestMessage {
    pub fn from_upload(upload: &UploadMessage) -> Self {
        Self {
            document_id: upload.document_id.clone(),
            knowledge_base_id: Some(upload.knowledge_base_id.clone()),
            session_id: None,
            object_key: upload.object_key.clone(),
            file_name: upload.file_name.clone(),
            content_type: upload.content_type.clone(),
            user_id: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TranscriptionStatus {
    Success,
    Failed,
    Timeout,
}

impl TranscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscriptionStatus::Success => "Success",
            TranscriptionStatus::Failed => "Failed",
            TranscriptionStatus::Timeout => "Timeout",
        }
    }
}

/// Published by the external transcription worker once a transcript is
/// available (or the attempt gave up); resumes the ingestion pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TranscribeCompletedMessage {
    pub document_id: String,
    pub transcribed_text_object_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub status: TranscriptionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_message_uses_camel_case_on_the_wire() {
        let message = UploadMessage {
            document_id: "doc-1".into(),
            knowledge_base_id: "kb-1".into(),
            object_key: "tenant/doc-1/report.pdf".into(),
            file_name: "report.pdf".into(),
            content_type: "application/pdf".into(),
            created_at: Utc::now(),
        };

        let value = serde_json::to_value(&message).expect("serializes");
        assert!(value.get("documentId").is_some());
        assert!(value.get("knowledgeBaseId").is_some());
        assert!(value.get("objectKey").is_some());
        assert!(value.get("document_id").is_none());
    }

    #[test]
    fn transcribe_completed_round_trips_optional_fields() {
        let raw = r#"{
            "documentId": "doc-2",
            "transcribedTextObjectKey": "tenant/doc-2/transcript.txt",
            "status": "Timeout",
            "error": "asr timeout",
            "createdAt": "2025-01-15T10:00:00Z"
        }"#;

        let message: TranscribeCompletedMessage =
            serde_json::from_str(raw).expect("deserializes without provider/durationMs");
        assert_eq!(message.status, TranscriptionStatus::Timeout);
        assert_eq!(message.error.as_deref(), Some("asr timeout"));
        assert!(message.provider.is_none());
        assert!(message.duration_ms.is_none());
    }

    #[test]
    fn transcribe_request_carries_upload_identity() {
        let upload = UploadMessage {
            document_id: "doc-3".into(),
            knowledge_base_id: "kb-9".into(),
            object_key: "tenant/doc-3/meeting.mp3".into(),
            file_name: "meeting.mp3".into(),
            content_type: "audio/mpeg".into(),
            created_at: Utc::now(),
        };

        let request = TranscribeRequestMessage::from_upload(&upload);
        assert_eq!(request.document_id, upload.document_id);
        assert_eq!(request.knowledge_base_id.as_deref(), Some("kb-9"));
        assert_eq!(request.object_key, upload.object_key);
        assert!(request.session_id.is_none());
    }
}
