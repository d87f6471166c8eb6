use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use common::{
    error::AppError,
    storage::{
        store::StorageManager,
        types::document::Document,
        vector::{tenant_collection, CollectionSpec, VectorPoint, VectorStore},
    },
    utils::embedding::EmbeddingProvider,
};
use serde_json::json;
use text_splitter::{ChunkConfig, TextSplitter};
use tracing::debug;

/// Content types handed to the external transcription worker instead of
/// the parse stage.
pub fn requires_transcription(content_type: &str) -> bool {
    content_type.starts_with("audio/") || content_type.starts_with("video/")
}

fn is_text_like(content_type: &str) -> bool {
    content_type.starts_with("text/")
        || matches!(content_type, "application/json" | "application/xml")
}

#[derive(Debug, Clone)]
pub struct PipelineTuning {
    pub chunk_min_chars: usize,
    pub chunk_max_chars: usize,
    pub chunk_overlap_chars: usize,
}

impl Default for PipelineTuning {
    fn default() -> Self {
        Self {
            chunk_min_chars: 200,
            chunk_max_chars: 2_000,
            chunk_overlap_chars: 200,
        }
    }
}

/// Seam between the status machine and the slow collaborators. Everything
/// a pipeline stage touches outside the document record goes through here,
/// which keeps the processor drivable with mocks.
#[async_trait]
pub trait PipelineServices: Send + Sync {
    async fn load_source(&self, document: &Document) -> Result<Bytes, AppError>;

    async fn parse_text(&self, document: &Document, source: Bytes) -> Result<String, AppError>;

    fn chunk_text(&self, text: &str) -> Result<Vec<String>, AppError>;

    async fn embed_chunks(&self, chunks: &[String]) -> Result<Vec<Vec<f32>>, AppError>;

    async fn index_chunks(
        &self,
        document: &Document,
        chunks: &[String],
        embeddings: Vec<Vec<f32>>,
    ) -> Result<usize, AppError>;
}

pub struct DefaultPipelineServices {
    storage: StorageManager,
    vector_store: Arc<dyn VectorStore>,
    embedding_provider: Arc<EmbeddingProvider>,
    tuning: PipelineTuning,
    collection_prefix: String,
}

impl DefaultPipelineServices {
    pub fn new(
        storage: StorageManager,
        vector_store: Arc<dyn VectorStore>,
        embedding_provider: Arc<EmbeddingProvider>,
        tuning: PipelineTuning,
        collection_prefix: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            vector_store,
            embedding_provider,
            tuning,
            collection_prefix: collection_prefix.into(),
        }
    }
}

#[async_trait]
impl PipelineServices for DefaultPipelineServices {
    async fn load_source(&self, document: &Document) -> Result<Bytes, AppError> {
        Ok(self.storage.get(&document.object_key).await?)
    }

    async fn parse_text(&self, document: &Document, source: Bytes) -> Result<String, AppError> {
        if !is_text_like(&document.content_type) {
            return Err(AppError::Validation(format!(
                "unsupported content type {}",
                document.content_type
            )));
        }

        String::from_utf8(source.to_vec()).map_err(|_| {
            AppError::Validation(format!("document {} is not valid UTF-8", document.id))
        })
    }

    fn chunk_text(&self, text: &str) -> Result<Vec<String>, AppError> {
        let config = ChunkConfig::new(self.tuning.chunk_min_chars..self.tuning.chunk_max_chars)
            .with_overlap(self.tuning.chunk_overlap_chars)
            .map_err(|e| AppError::InternalError(format!("invalid chunk configuration: {e}")))?;
        let splitter = TextSplitter::new(config);

        let chunks: Vec<String> = splitter
            .chunks(text)
            .map(str::to_owned)
            .filter(|chunk| !chunk.trim().is_empty())
            .collect();

        if chunks.is_empty() {
            return Err(AppError::Validation(
                "document produced no indexable text".to_owned(),
            ));
        }
        Ok(chunks)
    }

    async fn embed_chunks(&self, chunks: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        Ok(self.embedding_provider.embed_batch(chunks.to_vec()).await?)
    }

    async fn index_chunks(
        &self,
        document: &Document,
        chunks: &[String],
        embeddings: Vec<Vec<f32>>,
    ) -> Result<usize, AppError> {
        if embeddings.len() != chunks.len() {
            return Err(AppError::InternalError(format!(
                "embedding count {} does not match chunk count {}",
                embeddings.len(),
                chunks.len()
            )));
        }

        let collection = tenant_collection(&self.collection_prefix, &document.tenant_id);
        self.vector_store
            .ensure_collection(
                &collection,
                CollectionSpec {
                    dimension: self.embedding_provider.dimension(),
                },
            )
            .await?;

        // Point ids are stable per (document, chunk index) so a retried
        // attempt overwrites its own vectors instead of duplicating them.
        let points: Vec<VectorPoint> = chunks
            .iter()
            .zip(embeddings)
            .enumerate()
            .map(|(index, (chunk, vector))| VectorPoint {
                id: format!("{}:{index}", document.id),
                vector,
                payload: json!({
                    "documentId": document.id,
                    "knowledgeBaseId": document.knowledge_base_id,
                    "chunkIndex": index,
                    "text": chunk,
                }),
            })
            .collect();

        let count = points.len();
        self.vector_store.upsert(&collection, points).await?;
        debug!(
            document_id = %document.id,
            collection = %collection,
            count,
            "vectors upserted"
        );
        Ok(count)
    }
}
