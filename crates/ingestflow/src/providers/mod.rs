//! Provider abstractions for the external collaborators
//!
//! The orchestration core consumes these interfaces; concrete extraction,
//! embedding models, and vector database clients live behind them.

pub mod embedding;
pub mod extractor;
pub mod vector_store;

pub use embedding::EmbeddingProvider;
pub use extractor::{ExtractedText, TextExtractor};
pub use vector_store::{VectorMatch, VectorRecord, VectorStoreProvider};
