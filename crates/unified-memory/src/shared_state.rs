//! Shared system state
//!
//! One container owning the store, the classifier, the coordinator and the
//! capture pool. API handlers and background workers reach every subsystem
//! through it via `Arc`.

use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::classifier::{Classifier, RawEvent};
use crate::config::Config;
use crate::coordinator::InstanceCoordinator;
use crate::embedding::EmbeddingService;
use crate::error::Result;
use crate::memory_db::MemoryStore;
use crate::retrieval::hybrid::{SearchHit, SearchRequest};
use crate::retrieval::scoring::HybridWeights;
use crate::thread_pool::{ThreadPool, ThreadPoolConfig};
use crate::worker_threads::LlmWorker;

/// Atomic counters for request accounting.
#[derive(Debug, Default)]
pub struct AtomicCounters {
    pub total_requests: AtomicUsize,
    pub searches: AtomicUsize,
    pub query_embeddings_failed: AtomicUsize,
}

impl AtomicCounters {
    pub fn inc_total_requests(&self) -> usize {
        self.total_requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_searches(&self) -> usize {
        self.searches.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_query_embeddings_failed(&self) -> usize {
        crate::metrics::record_query_embedding_failure();
        self.query_embeddings_failed.fetch_add(1, Ordering::Relaxed) + 1
    }
}

pub struct SharedSystemState {
    /// Configuration (read-only after initialization)
    pub config: Arc<Config>,
    pub store: Arc<MemoryStore>,
    pub classifier: Arc<Classifier>,
    pub coordinator: Arc<InstanceCoordinator>,
    /// Present only when an embedding provider is configured.
    pub embeddings: Option<Arc<EmbeddingService>>,
    pub capture: Arc<ThreadPool>,
    /// Search weights, swappable at runtime.
    pub weights: ArcSwap<HybridWeights>,
    pub counters: Arc<AtomicCounters>,
    shutdown_tx: watch::Sender<bool>,
}

impl SharedSystemState {
    /// Open the configured database and wire every subsystem to it.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let store = Arc::new(MemoryStore::open(&config.db_path, &config.store_options())?);
        Self::with_store(config, store)
    }

    pub fn with_store(config: Config, store: Arc<MemoryStore>) -> anyhow::Result<Self> {
        info!("Initializing shared system state");
        config.validate()?;

        let llm = config.fallback_url.as_ref().map(|url| {
            Arc::new(
                LlmWorker::new(url.clone(), config.fallback_model.clone(), config.embedding_model.clone())
                    .with_api_key(config.fallback_api_key.clone()),
            )
        });

        let mut classifier = Classifier::new(config.classifier_config());
        let embeddings = match &llm {
            Some(worker) => {
                classifier = classifier.with_fallback(worker.clone());
                Some(Arc::new(EmbeddingService::new(
                    worker.clone(),
                    config.embedding_dim,
                    config.embedding_cache_size,
                )))
            }
            None => {
                info!("No model backend configured; classifier fallback and embeddings disabled");
                None
            }
        };
        let classifier = Arc::new(classifier);

        let coordinator = Arc::new(InstanceCoordinator::new(store.clone(), config.coordinator_config()));
        let capture = Arc::new(ThreadPool::start(
            ThreadPoolConfig::new(&config),
            store.clone(),
            classifier.clone(),
        )?);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            weights: ArcSwap::from_pointee(config.search_weights),
            config: Arc::new(config),
            store,
            classifier,
            coordinator,
            embeddings,
            capture,
            counters: Arc::new(AtomicCounters::default()),
            shutdown_tx,
        })
    }

    pub async fn submit_event(&self, event: RawEvent) -> Result<String> {
        self.capture.submit_event(event).await
    }

    /// Hybrid search with configured defaults. The query is embedded when a
    /// provider is available; provider failures fall back to keyword and
    /// centrality only.
    pub async fn search(&self, mut request: SearchRequest) -> Result<Vec<SearchHit>> {
        self.counters.inc_searches();
        if request.limit.is_none() {
            request.limit = Some(self.config.search_default_limit);
        }
        if request.query_embedding.is_none() && !request.query.trim().is_empty() {
            if let Some(service) = &self.embeddings {
                match service.embed_query(&request.query).await {
                    Ok(embedding) => request.query_embedding = Some(embedding),
                    Err(e) => {
                        self.counters.inc_query_embeddings_failed();
                        warn!(error = %e, "Query embedding failed, searching without vectors");
                    }
                }
            }
        }

        let weights = **self.weights.load();
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.search(&request, &weights)).await?
    }

    pub fn set_weights(&self, weights: HybridWeights) -> Result<()> {
        weights.validate()?;
        self.weights.store(Arc::new(weights));
        info!(
            keyword = weights.keyword,
            vector = weights.vector,
            centrality = weights.centrality,
            "Search weights updated"
        );
        Ok(())
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Tell background workers to stop and drain the capture queue.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx.send_replace(true);
        self.capture.shutdown().await
    }
}

/// Unified application state for all API handlers.
#[derive(Clone)]
pub struct UnifiedAppState {
    pub shared_state: Arc<SharedSystemState>,
}

impl UnifiedAppState {
    pub fn new(shared_state: Arc<SharedSystemState>) -> Self {
        Self { shared_state }
    }
}

// Re-exports for convenience
pub use self::SharedSystemState as SharedState;
