//! Drives the relationship engine off store change notifications, with a
//! periodic poll as a backstop for writes made by other processes.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{MemoryError, Result};
use crate::memory_db::MemoryStore;
use crate::relationship::{ProcessReport, RelationshipEngine};

pub struct RelationWorker {
    store: Arc<MemoryStore>,
    engine: Arc<RelationshipEngine>,
}

impl RelationWorker {
    pub fn new(store: Arc<MemoryStore>, engine: RelationshipEngine) -> Self {
        Self { store, engine: Arc::new(engine) }
    }

    /// One full pass over pending change-log entries.
    pub async fn run_once(&self) -> Result<ProcessReport> {
        let store = self.store.clone();
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.process_pending(&store)).await?
    }

    pub fn spawn(self: Arc<Self>, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut changes = self.store.subscribe();
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(consumer = self.engine.consumer(), "Relation worker started");

            loop {
                tokio::select! {
                    changed = changes.changed() => {
                        if changed.is_err() {
                            debug!("Change channel closed");
                            break;
                        }
                    }
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                match self.run_once().await {
                    Ok(report) if report.entries_seen > 0 => {
                        debug!(entries = report.entries_seen, links = report.links_written, "Relation pass")
                    }
                    Ok(_) => {}
                    Err(MemoryError::Internal(e)) => warn!(error = %e, "Relation pass failed"),
                    Err(e) => warn!(error = %e, "Relation pass rejected"),
                }
            }
            info!("Relation worker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::schema::{Node, NodeType};
    use crate::memory_db::StoreOptions;
    use crate::relationship::RelationConfig;

    #[tokio::test]
    async fn test_worker_reacts_to_new_nodes() {
        let store = Arc::new(MemoryStore::open_in_memory(&StoreOptions { embedding_dim: 2, ..Default::default() }).unwrap());
        let worker = Arc::new(RelationWorker::new(store.clone(), RelationshipEngine::new(&RelationConfig::default())));
        let (tx, rx) = watch::channel(false);
        let handle = worker.clone().spawn(Duration::from_secs(60), rx);

        store.upsert(Node::new("f1", NodeType::File, "").with_metadata("path", "src/db.rs")).unwrap();
        store
            .upsert(Node::new("c1", NodeType::Decision, "fix: pool").with_metadata("path", "src/db.rs"))
            .unwrap();

        let mut linked = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if store.edges_of("c1").unwrap().iter().any(|e| e.to_id == "f1") {
                linked = true;
                break;
            }
        }
        assert!(linked);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
}
