//! Memory database module - SQLite-backed storage for nodes, edges, sessions,
//! leases and the change log.
pub mod change_log;
pub mod coordination_store;
pub mod edge_store;
pub mod embedding_store;
pub mod migration;
pub mod node_store;
pub mod schema;

pub use embedding_store::StaleEmbedding;
pub use migration::MigrationManager;
pub use node_store::UpsertOutcome;
pub use schema::*;

use chrono::Utc;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Transaction, TransactionBehavior};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{MemoryError, Result};
use crate::retrieval::graph_walk::{self, Neighbor, NeighborQuery};
use crate::retrieval::hybrid::{self, SearchHit, SearchRequest};
use crate::retrieval::scoring::HybridWeights;

/// Storage knobs that are fixed for the lifetime of a store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub pool_size: u32,
    pub embedding_dim: usize,
    pub busy_timeout_ms: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            pool_size: 8,
            embedding_dim: 384,
            busy_timeout_ms: 5000,
        }
    }
}

/// The durable node/edge graph plus coordination tables.
///
/// Every mutation runs in a `BEGIN IMMEDIATE` transaction and appends to the
/// change log before committing; the new log head is then published to
/// [`MemoryStore::subscribe`] receivers.
pub struct MemoryStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
    embedding_dim: usize,
    head_tx: watch::Sender<i64>,
}

impl MemoryStore {
    /// Open (or create) a database file and apply pending migrations.
    pub fn open(db_path: &Path, options: &StoreOptions) -> Result<Self> {
        info!("Opening memory database at: {}", db_path.display());

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| MemoryError::internal(format!("cannot create {}: {}", parent.display(), e)))?;
            }
        }

        let busy_timeout = options.busy_timeout_ms;
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(move |conn| {
                conn.busy_timeout(Duration::from_millis(busy_timeout))?;
                conn.execute_batch(
                    "PRAGMA foreign_keys = ON;
                     PRAGMA journal_mode = WAL;
                     PRAGMA synchronous = NORMAL;",
                )
            });
        let pool = Pool::builder().max_size(options.pool_size.max(1)).build(manager)?;

        Self::from_pool(pool, options)
    }

    /// Private in-memory database. The pool holds exactly one long-lived
    /// connection since every new `:memory:` connection is a separate database.
    pub fn open_in_memory(options: &StoreOptions) -> Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)?;

        Self::from_pool(pool, options)
    }

    fn from_pool(pool: Pool<SqliteConnectionManager>, options: &StoreOptions) -> Result<Self> {
        if options.embedding_dim == 0 {
            return Err(MemoryError::invalid("embedding dimension must be positive"));
        }
        let head = {
            let mut conn = pool.get()?;
            MigrationManager::new(&mut conn).initialize_database()?;
            change_log::head(&conn)?
        };
        let (head_tx, _) = watch::channel(head);

        info!(embedding_dim = options.embedding_dim, head, "Memory database initialized successfully");
        Ok(Self {
            pool: Arc::new(pool),
            embedding_dim: options.embedding_dim,
            head_tx,
        })
    }

    fn get_conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Run `f` inside an immediate (writer) transaction and publish the new
    /// change-log head once it commits.
    pub(crate) fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        let head = change_log::head(&tx)?;
        tx.commit()?;
        self.head_tx.send_if_modified(|current| {
            if *current != head {
                *current = head;
                true
            } else {
                false
            }
        });
        Ok(value)
    }

    /// Run `f` against one read snapshot.
    pub(crate) fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    pub fn upsert(&self, node: Node) -> Result<UpsertOutcome> {
        let dim = self.embedding_dim;
        self.write(|tx| node_store::upsert_node(tx, node, None, dim, Utc::now()))
    }

    /// Upsert after `reconcile` has adjusted the incoming node against the
    /// stored one. Both steps share one write transaction.
    pub(crate) fn upsert_reconciled<R>(&self, mut node: Node, reconcile: R) -> Result<UpsertOutcome>
    where
        R: FnOnce(&mut Node, &Node),
    {
        let dim = self.embedding_dim;
        self.write(|tx| {
            if let Some(stored) = node_store::get_node(tx, &node.id)? {
                reconcile(&mut node, &stored);
            }
            node_store::upsert_node(tx, node, None, dim, Utc::now())
        })
    }

    /// Compare-and-set on `version`; `0` asserts the node does not exist yet.
    pub fn upsert_versioned(&self, node: Node, expected_version: i64) -> Result<UpsertOutcome> {
        let dim = self.embedding_dim;
        self.write(|tx| node_store::upsert_node(tx, node, Some(expected_version), dim, Utc::now()))
    }

    pub fn get_node(&self, id: &str) -> Result<Node> {
        let conn = self.get_conn()?;
        node_store::require_node(&conn, id)
    }

    pub fn delete_node(&self, id: &str) -> Result<bool> {
        self.write(|tx| node_store::delete_node(tx, id, Utc::now()))
    }

    pub fn link(&self, from_id: &str, to_id: &str, relation: &str, metadata: Option<Value>) -> Result<Edge> {
        self.write(|tx| edge_store::link(tx, from_id, to_id, relation, metadata, Utc::now()))
    }

    pub fn unlink(&self, from_id: &str, to_id: &str, relation: &str) -> Result<bool> {
        self.write(|tx| edge_store::unlink(tx, from_id, to_id, relation, Utc::now()))
    }

    pub fn edges_of(&self, id: &str) -> Result<Vec<Edge>> {
        self.read(|tx| {
            node_store::require_node(tx, id)?;
            edge_store::edges_of(tx, id)
        })
    }

    /// Store a computed embedding. `false` means the node moved on or vanished.
    pub fn set_embedding(&self, id: &str, embedding: &[f32], expected_version: Option<i64>) -> Result<bool> {
        let dim = self.embedding_dim;
        self.write(|tx| embedding_store::set_embedding(tx, id, embedding, expected_version, dim, Utc::now()))
    }

    pub fn stale_embeddings(&self, limit: usize) -> Result<Vec<StaleEmbedding>> {
        let conn = self.get_conn()?;
        embedding_store::stale_embeddings(&conn, limit)
    }

    /// Nodes more similar than `threshold` to `embedding`, best first.
    pub fn similar_nodes(
        &self,
        embedding: &[f32],
        threshold: f32,
        limit: usize,
        exclude_id: Option<&str>,
    ) -> Result<Vec<(String, f32)>> {
        let conn = self.get_conn()?;
        embedding_store::find_similar(&conn, embedding, threshold, limit, exclude_id)
    }

    pub fn search(&self, request: &SearchRequest, weights: &HybridWeights) -> Result<Vec<SearchHit>> {
        let started = Instant::now();
        let hits = self.read(|tx| hybrid::run_search(tx, request, weights))?;
        crate::metrics::observe_search_latency(started.elapsed());
        debug!(hits = hits.len(), elapsed_ms = started.elapsed().as_millis() as u64, "Search finished");
        Ok(hits)
    }

    pub fn neighbors(&self, id: &str, query: &NeighborQuery) -> Result<Vec<Neighbor>> {
        self.read(|tx| graph_walk::walk(tx, id, query))
    }

    pub fn changes_since(&self, after_seq: i64, limit: usize) -> Result<Vec<ChangeEntry>> {
        let conn = self.get_conn()?;
        change_log::changes_since(&conn, after_seq, limit)
    }

    pub fn cursor(&self, consumer: &str) -> Result<i64> {
        let conn = self.get_conn()?;
        change_log::get_cursor(&conn, consumer)
    }

    pub fn set_cursor(&self, consumer: &str, seq: i64) -> Result<()> {
        let conn = self.get_conn()?;
        change_log::set_cursor(&conn, consumer, seq, &Utc::now())
    }

    /// Receiver that observes the change-log head after every commit.
    pub fn subscribe(&self) -> watch::Receiver<i64> {
        self.head_tx.subscribe()
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.get_conn()?;
        Ok(migration::get_database_stats(&conn)?)
    }

    /// Compact the change log below the slowest consumer, then ANALYZE and
    /// check integrity. Returns the number of log entries removed.
    pub fn run_maintenance(&self) -> Result<usize> {
        let removed = self.write(|tx| change_log::compact(tx))?;
        if removed > 0 {
            info!(removed, "Compacted change log");
        }
        let mut conn = self.get_conn()?;
        migration::run_maintenance(&mut conn)?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::open_in_memory(&StoreOptions { embedding_dim: 3, ..Default::default() }).unwrap()
    }

    #[test]
    fn test_in_memory_store_shares_one_database() {
        let store = store();
        store.upsert(Node::new("a", NodeType::Task, "one")).unwrap();
        // would fail if each pooled connection were a separate database
        assert_eq!(store.get_node("a").unwrap().text, "one");
        assert_eq!(store.stats().unwrap().total_nodes, 1);
    }

    #[test]
    fn test_commit_publishes_head() {
        let store = store();
        let rx = store.subscribe();
        assert_eq!(*rx.borrow(), 0);
        store.upsert(Node::new("a", NodeType::Task, "one")).unwrap();
        store.upsert(Node::new("b", NodeType::Task, "two")).unwrap();
        store.link("a", "b", "blocks", None).unwrap();
        assert_eq!(*rx.borrow(), 3);
        assert_eq!(store.changes_since(0, 100).unwrap().len(), 3);
    }

    #[test]
    fn test_failed_write_leaves_no_change_entry() {
        let store = store();
        store.upsert(Node::new("a", NodeType::Task, "one")).unwrap();
        assert!(store.link("a", "missing", "blocks", None).is_err());
        assert_eq!(store.changes_since(0, 100).unwrap().len(), 1);
    }

    #[test]
    fn test_maintenance_compacts_read_log_and_keeps_head() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");
        let options = StoreOptions { embedding_dim: 3, pool_size: 2, ..Default::default() };
        {
            let store = MemoryStore::open(&path, &options).unwrap();
            store.upsert(Node::new("a", NodeType::Task, "one")).unwrap();
            store.upsert(Node::new("b", NodeType::Task, "two")).unwrap();
            store.set_cursor("relations", 2).unwrap();

            assert_eq!(store.run_maintenance().unwrap(), 2);
            assert!(store.changes_since(0, 10).unwrap().is_empty());
            assert_eq!(store.stats().unwrap().change_log_head, 2);
        }
        let store = MemoryStore::open(&path, &options).unwrap();
        assert_eq!(*store.subscribe().borrow(), 2);
        store.upsert(Node::new("c", NodeType::Task, "three")).unwrap();
        let entries = store.changes_since(store.cursor("relations").unwrap(), 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].seq, 3);
        assert_eq!(entries[0].node_id, "c");
    }

    #[test]
    fn test_file_store_reopens_with_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("memory.db");
        let options = StoreOptions { embedding_dim: 3, pool_size: 2, ..Default::default() };
        {
            let store = MemoryStore::open(&path, &options).unwrap();
            store.upsert(Node::new("a", NodeType::Decision, "use sqlite")).unwrap();
        }
        let store = MemoryStore::open(&path, &options).unwrap();
        assert_eq!(store.get_node("a").unwrap().node_type, NodeType::Decision);
        assert_eq!(*store.subscribe().borrow(), 1);
    }
}
