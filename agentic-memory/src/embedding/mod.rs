//! Embedding module for semantic search
//!
//! The embedding model is an injected capability. `HashingEmbedder` is a
//! deterministic, dependency-free provider used when no model is wired in.

mod engine;
mod hashing;

use async_trait::async_trait;

use crate::error::Result;

pub use engine::{VectorEngine, DEFAULT_CACHE_CAPACITY};
pub use hashing::{HashingEmbedder, DEFAULT_DIMENSION};

/// Turns text into a dense vector
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Length of every vector this provider returns
    fn dimension(&self) -> usize;
}

/// Cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
