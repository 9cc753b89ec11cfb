//! Query and node embeddings behind a provider trait, with a small cache so
//! repeated searches do not hit the provider.

use async_trait::async_trait;
use moka::sync::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{MemoryError, Result};
use crate::memory_db::node_store::validate_embedding;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// One vector per input text, in input order.
    async fn embed(&self, texts: Vec<String>) -> anyhow::Result<Vec<Vec<f32>>>;
}

pub struct EmbeddingService {
    embedder: Arc<dyn Embedder>,
    dim: usize,
    cache: Cache<String, Arc<Vec<f32>>>,
}

impl EmbeddingService {
    pub fn new(embedder: Arc<dyn Embedder>, dim: usize, cache_capacity: u64) -> Self {
        Self {
            embedder,
            dim,
            cache: Cache::builder()
                .max_capacity(cache_capacity)
                .time_to_idle(Duration::from_secs(3600))
                .build(),
        }
    }

    /// Embed a search query, served from cache when seen before.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let key = text.trim().to_string();
        if key.is_empty() {
            return Err(MemoryError::invalid("cannot embed empty text"));
        }
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit.as_ref().clone());
        }
        let mut vectors = self.embed_batch(vec![key.clone()]).await?;
        let vector = vectors
            .pop()
            .ok_or_else(|| MemoryError::internal("embedding provider returned no vectors"))?;
        self.cache.insert(key, Arc::new(vector.clone()));
        Ok(vector)
    }

    /// Embed many texts without caching; every vector is dimension-checked.
    pub async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let expected = texts.len();
        let vectors = self
            .embedder
            .embed(texts)
            .await
            .map_err(|e| MemoryError::internal(format!("embedding provider failed: {}", e)))?;
        if vectors.len() != expected {
            return Err(MemoryError::internal(format!(
                "embedding provider returned {} vectors for {} texts",
                vectors.len(),
                expected
            )));
        }
        for vector in &vectors {
            validate_embedding(vector, self.dim)
                .map_err(|e| MemoryError::internal(format!("embedding provider: {}", e)))?;
        }
        debug!(count = vectors.len(), dim = self.dim, "Embedded texts");
        Ok(vectors)
    }

    pub fn cached_entries(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic embedder: bag of letters folded into `dim` buckets.
    pub(crate) struct LetterEmbedder {
        pub dim: usize,
        pub calls: AtomicUsize,
    }

    impl LetterEmbedder {
        pub(crate) fn new(dim: usize) -> Self {
            Self { dim, calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl Embedder for LetterEmbedder {
        async fn embed(&self, texts: Vec<String>) -> anyhow::Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0f32; self.dim];
                    for c in t.chars().filter(|c| c.is_ascii_alphabetic()) {
                        v[(c.to_ascii_lowercase() as usize) % self.dim] += 1.0;
                    }
                    v
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_query_embeddings_are_cached() {
        let embedder = Arc::new(LetterEmbedder::new(4));
        let service = EmbeddingService::new(embedder.clone(), 4, 16);
        let first = service.embed_query("pool sizing").await.unwrap();
        let second = service.embed_query("  pool sizing ").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(service.cached_entries(), 1);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_internal() {
        let service = EmbeddingService::new(Arc::new(LetterEmbedder::new(3)), 4, 16);
        let err = service.embed_query("anything").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Internal);
    }

    #[tokio::test]
    async fn test_empty_query_is_rejected() {
        let service = EmbeddingService::new(Arc::new(LetterEmbedder::new(4)), 4, 16);
        assert!(service.embed_query("   ").await.is_err());
        assert!(service.embed_batch(Vec::new()).await.unwrap().is_empty());
    }
}
