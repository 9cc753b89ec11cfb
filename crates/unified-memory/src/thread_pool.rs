//! Capture worker pool.
//!
//! Events are queued onto bounded per-worker channels and handled by
//! dedicated OS threads, each driving its own current-thread runtime. A
//! worker classifies the event, persists it as a node (id = event id, so
//! replays are idempotent) and retries storage failures a bounded number of
//! times. A replay keeps the type and classification of the first capture
//! even when it classifies differently the second time.
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};
use tracing::{debug, error, info, warn};

use crate::classifier::{ClassifiedEvent, Classifier, RawEvent};
use crate::config::Config;
use crate::error::{ErrorKind, MemoryError, Result};
use crate::memory_db::node_store::validate_id;
use crate::memory_db::schema::Node;
use crate::memory_db::{MemoryStore, UpsertOutcome};

#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    pub capture_workers: usize,
    /// Total queue capacity, split evenly across workers.
    pub queue_size: usize,
    pub queue_timeout: Duration,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

impl ThreadPoolConfig {
    pub fn new(config: &Config) -> Self {
        Self {
            capture_workers: config.capture_workers.max(1),
            queue_size: config.queue_size.max(1),
            queue_timeout: Duration::from_millis(config.queue_timeout_ms),
            max_attempts: config.capture_max_attempts.max(1),
            retry_backoff: Duration::from_millis(50),
        }
    }
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}

pub enum SystemCommand {
    Capture { event: RawEvent, enqueued_at: Instant },
    Shutdown,
}

/// Counters shared between the pool and its workers.
#[derive(Debug, Default)]
pub struct CaptureCounters {
    pub submitted: AtomicUsize,
    pub rejected: AtomicUsize,
    pub stored: AtomicUsize,
    pub failed: AtomicUsize,
    pub retried: AtomicUsize,
}

impl CaptureCounters {
    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "submitted": self.submitted.load(Ordering::Relaxed),
            "rejected": self.rejected.load(Ordering::Relaxed),
            "stored": self.stored.load(Ordering::Relaxed),
            "failed": self.failed.load(Ordering::Relaxed),
            "retried": self.retried.load(Ordering::Relaxed),
        })
    }
}

struct WorkerContext {
    store: Arc<MemoryStore>,
    classifier: Arc<Classifier>,
    counters: Arc<CaptureCounters>,
    max_attempts: u32,
    retry_backoff: Duration,
}

/// Metadata keys written by capture itself rather than carried by the event.
const CAPTURE_KEYS: [&str; 5] = ["source", "label", "confidence", "method", "captured_at"];

/// Build the node a classified event is stored as.
pub fn event_to_node(event: &RawEvent, classified: &ClassifiedEvent) -> Node {
    let mut node = Node::new(event.id.clone(), classified.suggested_type.clone(), event.text.trim());
    node.metadata = event.metadata.clone();
    node.metadata.insert("source".into(), json!(event.source.as_str()));
    node.metadata.insert("label".into(), json!(classified.label));
    node.metadata.insert("confidence".into(), json!(classified.confidence));
    node.metadata.insert("method".into(), json!(classified.method.as_str()));
    node.metadata.insert("captured_at".into(), json!(event.timestamp.to_rfc3339()));
    node.repo = event.repo.clone();
    node.author = event.author.clone();
    node.created_at = event.timestamp;
    node
}

/// Fold a replayed event onto the node its first capture produced.
fn keep_first_capture(node: &mut Node, stored: &Node) {
    node.node_type = stored.node_type.clone();
    if stored.repo.is_some() {
        node.repo = stored.repo.clone();
    }
    if stored.author.is_some() {
        node.author = stored.author.clone();
    }
    for key in CAPTURE_KEYS {
        match stored.metadata.get(key) {
            Some(value) => {
                node.metadata.insert(key.to_string(), value.clone());
            }
            None => {
                node.metadata.remove(key);
            }
        }
    }
}

impl WorkerContext {
    async fn handle(&self, event: RawEvent) -> Result<UpsertOutcome> {
        let classified = self.classifier.classify(&event).await?;
        let node = event_to_node(&event, &classified);

        let mut attempt = 1;
        loop {
            let store = self.store.clone();
            let candidate = node.clone();
            let result =
                tokio::task::spawn_blocking(move || store.upsert_reconciled(candidate, keep_first_capture)).await?;
            match result {
                Err(e) if e.kind() == ErrorKind::Internal && attempt < self.max_attempts => {
                    self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    warn!(event_id = %event.id, attempt, error = %e, "Storing event failed, retrying");
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

pub struct WorkerThread {
    name: String,
    thread_handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    fn spawn(name: String, receiver: mpsc::Receiver<SystemCommand>, context: Arc<WorkerContext>) -> Result<Self> {
        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(worker = %thread_name, error = %e, "Failed to create worker runtime");
                        return;
                    }
                };
                rt.block_on(Self::run_worker_loop(thread_name, receiver, context));
            })
            .map_err(|e| MemoryError::internal(format!("failed to spawn {}: {}", name, e)))?;

        info!("Spawned worker thread: {}", name);
        Ok(Self { name, thread_handle: Some(handle) })
    }

    async fn run_worker_loop(name: String, mut receiver: mpsc::Receiver<SystemCommand>, context: Arc<WorkerContext>) {
        while let Some(command) = receiver.recv().await {
            match command {
                SystemCommand::Capture { event, enqueued_at } => {
                    crate::metrics::dec_queue();
                    let event_id = event.id.clone();
                    match context.handle(event).await {
                        Ok(outcome) => {
                            context.counters.stored.fetch_add(1, Ordering::Relaxed);
                            debug!(
                                worker = %name,
                                event_id = %event_id,
                                node_type = %outcome.node.node_type,
                                created = outcome.created,
                                queued_ms = enqueued_at.elapsed().as_millis() as u64,
                                "Event stored"
                            );
                        }
                        Err(e) => {
                            context.counters.failed.fetch_add(1, Ordering::Relaxed);
                            error!(worker = %name, event_id = %event_id, error = %e, "Dropping event after failed capture");
                        }
                    }
                }
                SystemCommand::Shutdown => break,
            }
        }
        info!(worker = %name, "Worker thread shutting down");
    }

    fn join(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                error!(worker = %self.name, "Worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.join();
    }
}

pub struct ThreadPool {
    config: ThreadPoolConfig,
    senders: Vec<mpsc::Sender<SystemCommand>>,
    workers: Mutex<Vec<WorkerThread>>,
    next: AtomicUsize,
    closed: AtomicBool,
    counters: Arc<CaptureCounters>,
}

impl ThreadPool {
    pub fn start(config: ThreadPoolConfig, store: Arc<MemoryStore>, classifier: Arc<Classifier>) -> Result<Self> {
        info!("Starting capture pool with config: {:?}", config);
        let counters = Arc::new(CaptureCounters::default());
        let context = Arc::new(WorkerContext {
            store,
            classifier,
            counters: counters.clone(),
            max_attempts: config.max_attempts,
            retry_backoff: config.retry_backoff,
        });

        let workers_n = config.capture_workers.max(1);
        let per_worker = (config.queue_size / workers_n).max(1);
        let mut senders = Vec::with_capacity(workers_n);
        let mut workers = Vec::with_capacity(workers_n);
        for i in 0..workers_n {
            let (tx, rx) = mpsc::channel(per_worker);
            workers.push(WorkerThread::spawn(format!("capture-worker-{}", i), rx, context.clone())?);
            senders.push(tx);
        }

        info!("Capture pool started with {} workers", workers.len());
        Ok(Self {
            config,
            senders,
            workers: Mutex::new(workers),
            next: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            counters,
        })
    }

    pub fn counters(&self) -> &Arc<CaptureCounters> {
        &self.counters
    }

    /// Queue an event and return its id without waiting for classification.
    ///
    /// Tries every worker queue once; if all are full, waits up to the queue
    /// timeout on one of them and then fails with `Internal`.
    pub async fn submit_event(&self, mut event: RawEvent) -> Result<String> {
        let source = event.source;
        if event.text.trim().is_empty() {
            self.reject(source.as_str(), "invalid");
            return Err(MemoryError::invalid("event text is empty"));
        }
        if !event.id.is_empty() {
            if let Err(e) = validate_id(&event.id) {
                self.reject(source.as_str(), "invalid");
                return Err(e);
            }
        }
        if self.closed.load(Ordering::Acquire) {
            self.reject(source.as_str(), "closed");
            return Err(MemoryError::internal("capture pool is shut down"));
        }
        if event.id.is_empty() {
            event.id = uuid::Uuid::new_v4().to_string();
        }
        let event_id = event.id.clone();

        let start = self.next.fetch_add(1, Ordering::Relaxed);
        let n = self.senders.len();
        let mut command = SystemCommand::Capture { event, enqueued_at: Instant::now() };
        for offset in 0..n {
            match self.senders[(start + offset) % n].try_send(command) {
                Ok(()) => return Ok(self.accepted(source.as_str(), event_id)),
                Err(TrySendError::Full(back)) => command = back,
                Err(TrySendError::Closed(_)) => {
                    self.reject(source.as_str(), "closed");
                    return Err(MemoryError::internal("capture worker is gone"));
                }
            }
        }

        match self.senders[start % n].send_timeout(command, self.config.queue_timeout).await {
            Ok(()) => Ok(self.accepted(source.as_str(), event_id)),
            Err(SendTimeoutError::Timeout(_)) => {
                self.reject(source.as_str(), "queue_full");
                warn!(source = %source, "Capture queue full, event rejected");
                Err(MemoryError::internal(format!(
                    "capture queue full for {} ms",
                    self.config.queue_timeout.as_millis()
                )))
            }
            Err(SendTimeoutError::Closed(_)) => {
                self.reject(source.as_str(), "closed");
                Err(MemoryError::internal("capture worker is gone"))
            }
        }
    }

    fn accepted(&self, source: &str, event_id: String) -> String {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_event_submitted(source);
        crate::metrics::inc_queue();
        event_id
    }

    fn reject(&self, source: &str, reason: &str) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_event_rejected(source, reason);
    }

    /// Stop accepting events, let workers drain their queues and join them.
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Shutting down capture pool");
        for sender in &self.senders {
            let _ = sender.send(SystemCommand::Shutdown).await;
        }
        let workers = self
            .workers
            .lock()
            .map(|mut guard| std::mem::take(&mut *guard))
            .unwrap_or_default();
        tokio::task::spawn_blocking(move || drop(workers)).await?;
        info!("Capture pool shutdown complete");
        Ok(())
    }
}
