use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::AppError;

use super::types::document::{truncate_error, validate_transition, Document, DocumentStatus};

/// System-of-record access for `Document` rows. Every mutation is scoped by
/// `tenant_id`; a mismatch surfaces as `NotFound` so callers cannot learn
/// about documents owned by other tenants.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    async fn get(&self, document_id: &str) -> Result<Option<Document>, AppError>;

    async fn insert(&self, document: Document) -> Result<(), AppError>;

    async fn update_status(
        &self,
        tenant_id: &str,
        document_id: &str,
        status: DocumentStatus,
        error: Option<String>,
    ) -> Result<Document, AppError>;

    async fn store_content(
        &self,
        tenant_id: &str,
        document_id: &str,
        content: String,
    ) -> Result<Document, AppError>;

    async fn record_retry(&self, tenant_id: &str, document_id: &str)
        -> Result<Document, AppError>;

    async fn reset_retries(
        &self,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<Document, AppError>;

    async fn list_by_status(
        &self,
        status: DocumentStatus,
        limit: usize,
    ) -> Result<Vec<Document>, AppError>;
}

/// In-memory repository used by tests and the self-contained dev worker.
#[derive(Default)]
pub struct InMemoryDocumentRepository {
    documents: RwLock<HashMap<String, Document>>,
}

impl InMemoryDocumentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn not_found(document_id: &str) -> AppError {
        AppError::NotFound(format!("document {document_id}"))
    }
}

#[async_trait]
impl DocumentRepository for InMemoryDocumentRepository {
    async fn get(&self, document_id: &str) -> Result<Option<Document>, AppError> {
        Ok(self.documents.read().await.get(document_id).cloned())
    }

    async fn insert(&self, document: Document) -> Result<(), AppError> {
        let mut documents = self.documents.write().await;
        if documents.contains_key(&document.id) {
            return Err(AppError::Validation(format!(
                "document {} already exists",
                document.id
            )));
        }
        documents.insert(document.id.clone(), document);
        Ok(())
    }

    async fn update_status(
        &self,
        tenant_id: &str,
        document_id: &str,
        status: DocumentStatus,
        error: Option<String>,
    ) -> Result<Document, AppError> {
        let mut documents = self.documents.write().await;
        let document = documents
            .get_mut(document_id)
            .filter(|document| document.tenant_id == tenant_id)
            .ok_or_else(|| Self::not_found(document_id))?;

        validate_transition(&document.status, &status)?;

        document.status = status;
        document.error_message = error.map(|message| truncate_error(&message));
        document.updated_at = Utc::now();
        Ok(document.clone())
    }

    async fn store_content(
        &self,
        tenant_id: &str,
        document_id: &str,
        content: String,
    ) -> Result<Document, AppError> {
        let mut documents = self.documents.write().await;
        let document = documents
            .get_mut(document_id)
            .filter(|document| document.tenant_id == tenant_id)
            .ok_or_else(|| Self::not_found(document_id))?;

        document.content = Some(content);
        document.updated_at = Utc::now();
        Ok(document.clone())
    }

    async fn record_retry(
        &self,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<Document, AppError> {
        let mut documents = self.documents.write().await;
        let document = documents
            .get_mut(document_id)
            .filter(|document| document.tenant_id == tenant_id)
            .ok_or_else(|| Self::not_found(document_id))?;

        let now = Utc::now();
        document.retry_count = document.retry_count.saturating_add(1);
        document.last_retry_at = Some(now);
        document.updated_at = now;
        Ok(document.clone())
    }

    async fn reset_retries(
        &self,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<Document, AppError> {
        let mut documents = self.documents.write().await;
        let document = documents
            .get_mut(document_id)
            .filter(|document| document.tenant_id == tenant_id)
            .ok_or_else(|| Self::not_found(document_id))?;

        document.retry_count = 0;
        document.last_retry_at = None;
        document.updated_at = Utc::now();
        Ok(document.clone())
    }

    async fn list_by_status(
        &self,
        status: DocumentStatus,
        limit: usize,
    ) -> Result<Vec<Document>, AppError> {
        let documents = self.documents.read().await;
        let mut matching: Vec<Document> = documents
            .values()
            .filter(|document| document.status == status)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        matching.truncate(limit);
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_document() -> Document {
        Document::new(
            "tenant-1",
            "kb-1",
            "notes.txt",
            "text/plain",
            "tenant-1/doc/notes.txt",
        )
    }

    #[tokio::test]
    async fn update_is_scoped_by_tenant() {
        let repository = InMemoryDocumentRepository::new();
        let document = sample_document();
        let id = document.id.clone();
        repository.insert(document).await.expect("insert");

        let result = repository
            .update_status(
                "other-tenant",
                &id,
                DocumentStatus::Parsing,
                None,
            )
            .await;
        assert!(matches!(result, Err(AppError::NotFound(_))));

        let untouched = repository.get(&id).await.expect("get").expect("exists");
        assert_eq!(untouched.status, DocumentStatus::Uploaded);
    }

    #[tokio::test]
    async fn update_status_enforces_the_transition_graph() {
        let repository = InMemoryDocumentRepository::new();
        let document = sample_document();
        let id = document.id.clone();
        repository.insert(document).await.expect("insert");

        let result = repository
            .update_status("tenant-1", &id, DocumentStatus::Indexed, None)
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));

        repository
            .update_status("tenant-1", &id, DocumentStatus::Parsing, None)
            .await
            .expect("Uploaded -> Parsing is valid");
    }

    #[tokio::test]
    async fn retry_bookkeeping_increments_and_resets() {
        let repository = InMemoryDocumentRepository::new();
        let document = sample_document();
        let id = document.id.clone();
        repository.insert(document).await.expect("insert");

        let after_first = repository
            .record_retry("tenant-1", &id)
            .await
            .expect("first retry");
        assert_eq!(after_first.retry_count, 1);
        assert!(after_first.last_retry_at.is_some());

        let after_second = repository
            .record_retry("tenant-1", &id)
            .await
            .expect("second retry");
        assert_eq!(after_second.retry_count, 2);

        let reset = repository
            .reset_retries("tenant-1", &id)
            .await
            .expect("reset");
        assert_eq!(reset.retry_count, 0);
        assert!(reset.last_retry_at.is_none());
    }

    #[tokio::test]
    async fn list_by_status_honours_the_limit() {
        let repository = InMemoryDocumentRepository::new();
        for _ in 0..3 {
            repository
                .insert(sample_document())
                .await
                .expect("insert");
        }

        let uploaded = repository
            .list_by_status(DocumentStatus::Uploaded, 2)
            .await
            .expect("list");
        assert_eq!(uploaded.len(), 2);

        let failed = repository
            .list_by_status(DocumentStatus::Failed, 10)
            .await
            .expect("list");
        assert!(failed.is_empty());
    }

    #[tokio::test]
    async fn stored_error_messages_are_truncated() {
        let repository = InMemoryDocumentRepository::new();
        let document = sample_document();
        let id = document.id.clone();
        repository.insert(document).await.expect("insert");

        repository
            .update_status("tenant-1", &id, DocumentStatus::Parsing, None)
            .await
            .expect("parsing");
        let failed = repository
            .update_status(
                "tenant-1",
                &id,
                DocumentStatus::Failed,
                Some("e".repeat(2_000)),
            )
            .await
            .expect("failed");

        let stored = failed.error_message.expect("error recorded");
        assert_eq!(stored.chars().count(), 512);
    }
}
