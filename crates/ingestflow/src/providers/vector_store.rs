//! Vector store provider trait for storing and searching embeddings

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// A vector with identity and metadata, ready for upsert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub metadata: serde_json::Value,
}

/// Search result from the vector store
#[derive(Debug, Clone, Serialize)]
pub struct VectorMatch {
    pub id: Uuid,
    /// Similarity score (higher is more similar)
    pub score: f32,
    pub metadata: serde_json::Value,
}

/// Trait for vector storage and similarity search
///
/// All calls are routed through the connection pool; implementations only
/// need to speak to the store itself.
#[async_trait]
pub trait VectorStoreProvider: Send + Sync {
    /// Insert or update vectors in a namespace
    async fn upsert(&self, records: &[VectorRecord], namespace: &str) -> Result<()>;

    /// Search for similar vectors in a namespace
    async fn query(
        &self,
        vector: &[f32],
        namespace: &str,
        top_k: usize,
        filter: Option<&serde_json::Value>,
    ) -> Result<Vec<VectorMatch>>;

    /// Get total number of vectors stored in a namespace
    async fn len(&self, namespace: &str) -> Result<usize>;

    /// Check if the provider is healthy
    async fn health_check(&self) -> Result<bool>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}
