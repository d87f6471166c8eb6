use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub point: VectorPoint,
    pub score: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct CollectionSpec {
    pub dimension: usize,
}

/// Collections are namespaced per tenant so vectors from different tenants
/// never share a search space.
pub fn tenant_collection(prefix: &str, tenant_id: &str) -> String {
    format!("{prefix}_{tenant_id}")
}

/// Vector search backend, consumed as an opaque capability.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn ensure_collection(
        &self,
        collection: &str,
        spec: CollectionSpec,
    ) -> Result<(), AppError>;

    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<(), AppError>;

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredPoint>, AppError>;
}

struct CollectionData {
    dimension: usize,
    points: HashMap<String, VectorPoint>,
}

/// In-memory vector store with cosine scoring, used by tests and the
/// self-contained dev worker.
#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, CollectionData>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn point_count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map_or(0, |data| data.points.len())
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn ensure_collection(
        &self,
        collection: &str,
        spec: CollectionSpec,
    ) -> Result<(), AppError> {
        let mut collections = self.collections.write().await;
        match collections.get(collection) {
            Some(existing) if existing.dimension != spec.dimension => {
                Err(AppError::Validation(format!(
                    "collection {collection} exists with dimension {}, requested {}",
                    existing.dimension, spec.dimension
                )))
            }
            Some(_) => Ok(()),
            None => {
                collections.insert(
                    collection.to_owned(),
                    CollectionData {
                        dimension: spec.dimension,
                        points: HashMap::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<(), AppError> {
        let mut collections = self.collections.write().await;
        let data = collections.get_mut(collection).ok_or_else(|| {
            AppError::NotFound(format!("vector collection {collection}"))
        })?;

        for point in points {
            if point.vector.len() != data.dimension {
                return Err(AppError::Validation(format!(
                    "vector for point {} has dimension {}, collection {collection} expects {}",
                    point.id,
                    point.vector.len(),
                    data.dimension
                )));
            }
            data.points.insert(point.id.clone(), point);
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredPoint>, AppError> {
        let collections = self.collections.read().await;
        let data = collections.get(collection).ok_or_else(|| {
            AppError::NotFound(format!("vector collection {collection}"))
        })?;

        let mut hits: Vec<ScoredPoint> = data
            .points
            .values()
            .map(|point| ScoredPoint {
                score: cosine_similarity(vector, &point.vector),
                point: point.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn point(id: &str, vector: Vec<f32>) -> VectorPoint {
        VectorPoint {
            id: id.into(),
            vector,
            payload: json!({ "documentId": id }),
        }
    }

    #[tokio::test]
    async fn search_ranks_by_cosine_similarity() {
        let store = InMemoryVectorStore::new();
        store
            .ensure_collection("documents_tenant-1", CollectionSpec { dimension: 2 })
            .await
            .expect("collection");

        store
            .upsert(
                "documents_tenant-1",
                vec![
                    point("aligned", vec![1.0, 0.0]),
                    point("orthogonal", vec![0.0, 1.0]),
                ],
            )
            .await
            .expect("upsert");

        let hits = store
            .search("documents_tenant-1", &[1.0, 0.0], 1)
            .await
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].point.id, "aligned");
    }

    #[tokio::test]
    async fn upsert_replaces_points_with_the_same_id() {
        let store = InMemoryVectorStore::new();
        store
            .ensure_collection("c", CollectionSpec { dimension: 2 })
            .await
            .expect("collection");

        store
            .upsert("c", vec![point("p", vec![1.0, 0.0])])
            .await
            .expect("first upsert");
        store
            .upsert("c", vec![point("p", vec![0.0, 1.0])])
            .await
            .expect("second upsert");

        assert_eq!(store.point_count("c").await, 1);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected() {
        let store = InMemoryVectorStore::new();
        store
            .ensure_collection("c", CollectionSpec { dimension: 3 })
            .await
            .expect("collection");

        let result = store.upsert("c", vec![point("p", vec![1.0, 0.0])]).await;
        assert!(matches!(result, Err(AppError::Validation(_))));

        let recreate = store
            .ensure_collection("c", CollectionSpec { dimension: 4 })
            .await;
        assert!(matches!(recreate, Err(AppError::Validation(_))));
    }

    #[test]
    fn tenant_collections_are_namespaced() {
        assert_eq!(
            tenant_collection("documents", "tenant-1"),
            "documents_tenant-1"
        );
    }
}
