//! Text extraction provider trait

use async_trait::async_trait;

use crate::error::Result;

/// Extracted text with provenance metadata
#[derive(Debug, Clone)]
pub struct ExtractedText {
    /// Plain text content
    pub content: String,
    /// sha256 of the source bytes
    pub content_hash: String,
    /// Page count, when the format has pages
    pub total_pages: Option<u32>,
}

/// Trait for extracting plain text from uploaded files
///
/// Concrete per-format extraction (PDF, DOCX, spreadsheets, OCR) lives
/// behind this boundary; the orchestration core only schedules and times it.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Extract text from raw file bytes
    async fn extract(&self, filename: &str, data: &[u8]) -> Result<ExtractedText>;

    /// Check if the provider is healthy and available
    async fn health_check(&self) -> Result<bool>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}
