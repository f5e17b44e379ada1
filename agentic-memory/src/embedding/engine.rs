//! Vector embedding engine
//!
//! High-level API for generating and caching embeddings.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

use super::EmbeddingProvider;
use crate::error::{MemoryError, Result};

/// Embeddings kept when no capacity is configured
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Vector embedding engine with caching
///
/// Wraps any [`EmbeddingProvider`] with a bounded LRU cache so repeated
/// queries and re-synced records are embedded once without the cache
/// growing with the corpus.
pub struct VectorEngine {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Mutex<LruCache<String, Vec<f32>>>,
    dimension: usize,
}

impl VectorEngine {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self::with_cache_capacity(provider, DEFAULT_CACHE_CAPACITY)
    }

    /// A capacity of zero falls back to the default
    pub fn with_cache_capacity(provider: Arc<dyn EmbeddingProvider>, capacity: usize) -> Self {
        let dimension = provider.dimension();
        let capacity = NonZeroUsize::new(capacity)
            .or(NonZeroUsize::new(DEFAULT_CACHE_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);
        log::info!(
            "VectorEngine ready ({}d, cache of {} embeddings)",
            dimension,
            capacity
        );

        Self {
            provider,
            cache: Mutex::new(LruCache::new(capacity)),
            dimension,
        }
    }

    /// Generate embedding with caching
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let cached = self.cache.lock().get(text).cloned();
        if let Some(cached) = cached {
            return Ok(cached);
        }

        let embedding = self.provider.embed(text).await?;
        if embedding.len() != self.dimension {
            return Err(MemoryError::other(format!(
                "Embedding has {} dimensions, expected {}",
                embedding.len(),
                self.dimension
            )));
        }
        self.cache.lock().put(text.to_string(), embedding.clone());
        Ok(embedding)
    }

    /// Get embedding dimension
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Get cache size
    pub fn cache_size(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn cache_capacity(&self) -> usize {
        self.cache.lock().cap().get()
    }

    /// Clear the cache
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }
}
