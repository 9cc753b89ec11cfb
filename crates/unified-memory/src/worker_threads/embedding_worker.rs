//! Background refresh of missing or stale node embeddings.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::embedding::EmbeddingService;
use crate::error::Result;
use crate::memory_db::MemoryStore;

pub struct EmbeddingWorker {
    store: Arc<MemoryStore>,
    service: Arc<EmbeddingService>,
    batch_size: usize,
}

impl EmbeddingWorker {
    pub fn new(store: Arc<MemoryStore>, service: Arc<EmbeddingService>, batch_size: usize) -> Self {
        Self { store, service, batch_size: batch_size.max(1) }
    }

    /// Embed one batch of stale nodes. Returns how many were written; nodes
    /// edited while their embedding was computed are left for the next pass.
    pub async fn refresh_once(&self) -> Result<usize> {
        let store = self.store.clone();
        let limit = self.batch_size;
        let stale = tokio::task::spawn_blocking(move || store.stale_embeddings(limit)).await??;
        if stale.is_empty() {
            return Ok(0);
        }

        let texts = stale.iter().map(|s| s.text.clone()).collect();
        let vectors = self.service.embed_batch(texts).await?;

        let store = self.store.clone();
        let written = tokio::task::spawn_blocking(move || -> Result<usize> {
            let mut written = 0;
            for (item, vector) in stale.iter().zip(vectors) {
                if store.set_embedding(&item.node_id, &vector, Some(item.version))? {
                    written += 1;
                } else {
                    debug!(node_id = %item.node_id, "Node changed during embedding, retrying later");
                }
            }
            Ok(written)
        })
        .await??;
        Ok(written)
    }

    pub fn spawn(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(batch = self.batch_size, "Embedding worker started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // drain while full batches keep coming back
                        loop {
                            match self.refresh_once().await {
                                Ok(n) if n >= self.batch_size => continue,
                                Ok(n) => {
                                    if n > 0 {
                                        debug!(refreshed = n, "Embeddings refreshed");
                                    }
                                    break;
                                }
                                Err(e) => {
                                    warn!(error = %e, "Embedding refresh failed");
                                    break;
                                }
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Embedding worker stopped");
        })
    }
}
