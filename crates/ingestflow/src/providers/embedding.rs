//! Embedding provider trait

use async_trait::async_trait;

use crate::error::Result;

/// Trait for turning text into embedding vectors.
///
/// Providers are assumed to be rate-limited and batchable; the batch
/// collector owns batching, deduplication, caching, and retry around this
/// interface, so implementations only need to speak to the model itself.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts.
    ///
    /// The default falls back to sequential `embed` calls; providers with a
    /// native batch endpoint should override it.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }

    /// Dimensionality of the vectors this provider produces
    fn dimensions(&self) -> usize;

    /// Check if the provider is healthy and available
    async fn health_check(&self) -> Result<bool>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}
