use serde::Serialize;
use tracing::{debug, info, warn};

use super::strategies::{InferenceStrategy, ProposedLink, SemanticSimilarity, SharedFile, TemporalProximity};
use super::RelationConfig;
use crate::error::Result;
use crate::memory_db::node_store;
use crate::memory_db::schema::{ChangeEntry, ChangeKind};
use crate::memory_db::MemoryStore;

pub const DEFAULT_CONSUMER: &str = "relationship-engine";

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ProcessReport {
    pub entries_seen: usize,
    pub nodes_processed: usize,
    pub links_written: usize,
    pub link_failures: usize,
    pub cursor: i64,
}

/// Consumes the change log and writes inferred edges back through the store.
pub struct RelationshipEngine {
    consumer: String,
    strategies: Vec<Box<dyn InferenceStrategy>>,
    batch_size: usize,
}

impl RelationshipEngine {
    pub fn new(config: &RelationConfig) -> Self {
        let strategies: Vec<Box<dyn InferenceStrategy>> = vec![
            Box::new(TemporalProximity { window: config.temporal_window }),
            Box::new(SharedFile),
            Box::new(SemanticSimilarity {
                threshold: config.similarity_threshold,
                max_links: config.max_semantic_links,
            }),
        ];
        Self::with_strategies(DEFAULT_CONSUMER, strategies, config.batch_size)
    }

    pub fn with_strategies(
        consumer: impl Into<String>,
        strategies: Vec<Box<dyn InferenceStrategy>>,
        batch_size: usize,
    ) -> Self {
        Self {
            consumer: consumer.into(),
            strategies,
            batch_size: batch_size.max(1),
        }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Drain every entry after the persisted cursor. The cursor advances
    /// after each entry, so a crash replays at most one entry.
    pub fn process_pending(&self, store: &MemoryStore) -> Result<ProcessReport> {
        let mut report = ProcessReport {
            cursor: store.cursor(&self.consumer)?,
            ..Default::default()
        };

        loop {
            let entries = store.changes_since(report.cursor, self.batch_size)?;
            if entries.is_empty() {
                break;
            }
            for entry in entries {
                report.entries_seen += 1;
                if is_relevant(&entry) {
                    self.process_entry(store, &entry, &mut report)?;
                }
                store.set_cursor(&self.consumer, entry.seq)?;
                report.cursor = entry.seq;
            }
        }

        if report.links_written > 0 || report.link_failures > 0 {
            info!(
                consumer = %self.consumer,
                entries = report.entries_seen,
                links = report.links_written,
                failures = report.link_failures,
                cursor = report.cursor,
                "Relationship inference pass finished"
            );
        }
        Ok(report)
    }

    fn process_entry(&self, store: &MemoryStore, entry: &ChangeEntry, report: &mut ProcessReport) -> Result<()> {
        let proposals = store.read(|tx| {
            let Some(node) = node_store::get_node(tx, &entry.node_id)? else {
                return Ok(None);
            };
            let mut proposals: Vec<ProposedLink> = Vec::new();
            for strategy in &self.strategies {
                match strategy.propose(tx, &node) {
                    Ok(links) => proposals.extend(links),
                    Err(e) => warn!(strategy = strategy.name(), node_id = %node.id, error = %e, "Inference strategy failed"),
                }
            }
            Ok(Some(proposals))
        })?;

        let Some(proposals) = proposals else {
            debug!(node_id = %entry.node_id, seq = entry.seq, "Node gone before inference, skipping");
            return Ok(());
        };
        report.nodes_processed += 1;

        for link in proposals {
            if link.to_id == entry.node_id {
                continue;
            }
            match store.link(&entry.node_id, &link.to_id, link.relation, Some(link.metadata)) {
                Ok(_) => report.links_written += 1,
                Err(e) => {
                    report.link_failures += 1;
                    warn!(from = %entry.node_id, to = %link.to_id, relation = link.relation, error = %e, "Inferred link failed");
                }
            }
        }
        Ok(())
    }
}

fn is_relevant(entry: &ChangeEntry) -> bool {
    matches!(entry.kind, ChangeKind::NodeUpserted | ChangeKind::EmbeddingUpdated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::schema::{Node, NodeType};
    use crate::memory_db::StoreOptions;
    use crate::relationship::strategies::{RELATION_RELATED_TO, RELATION_TOUCHES};

    fn store() -> MemoryStore {
        MemoryStore::open_in_memory(&StoreOptions { embedding_dim: 2, ..Default::default() }).unwrap()
    }

    #[test]
    fn test_links_shared_file_and_semantic_neighbors() {
        let store = store();
        let engine = RelationshipEngine::new(&RelationConfig::default());
        store.upsert(Node::new("f1", NodeType::File, "").with_metadata("path", "src/db.rs")).unwrap();
        store.upsert(Node::new("m1", NodeType::Message, "pool sizing").with_embedding(vec![1.0, 0.0])).unwrap();
        store
            .upsert(
                Node::new("c1", NodeType::Decision, "fix: pool exhaustion")
                    .with_metadata("path", "src/db.rs")
                    .with_embedding(vec![0.99, 0.05]),
            )
            .unwrap();

        let report = engine.process_pending(&store).unwrap();
        assert_eq!(report.link_failures, 0);

        let edges = store.edges_of("c1").unwrap();
        assert!(edges.iter().any(|e| e.from_id == "c1" && e.to_id == "f1" && e.relation == RELATION_TOUCHES));
        assert!(edges.iter().any(|e| e.to_id == "m1" && e.relation == RELATION_RELATED_TO));
        assert!(edges.iter().all(|e| e.from_id != e.to_id));
    }

    #[test]
    fn test_cursor_makes_second_pass_a_no_op() {
        let store = store();
        let engine = RelationshipEngine::new(&RelationConfig::default());
        store.upsert(Node::new("t1", NodeType::Task, "write docs")).unwrap();
        store.upsert(Node::new("m1", NodeType::Message, "docs are done")).unwrap();

        let first = engine.process_pending(&store).unwrap();
        assert!(first.links_written > 0);
        let second = engine.process_pending(&store).unwrap();
        assert_eq!(second.nodes_processed, 0);
        assert_eq!(second.links_written, 0);
        assert_eq!(store.cursor(DEFAULT_CONSUMER).unwrap(), second.cursor);
    }

    #[test]
    fn test_reprocessing_does_not_duplicate_edges() {
        let store = store();
        store.upsert(Node::new("t1", NodeType::Task, "write docs")).unwrap();
        store.upsert(Node::new("m1", NodeType::Message, "docs are done")).unwrap();

        RelationshipEngine::new(&RelationConfig::default()).process_pending(&store).unwrap();
        let before = store.stats().unwrap().total_edges;
        // a fresh consumer replays the whole log
        let replay = RelationshipEngine::with_strategies(
            "replay",
            vec![Box::new(crate::relationship::strategies::TemporalProximity {
                window: RelationConfig::default().temporal_window,
            })],
            10,
        );
        replay.process_pending(&store).unwrap();
        assert_eq!(store.stats().unwrap().total_edges, before);
    }

    #[test]
    fn test_deleted_node_is_skipped() {
        let store = store();
        store.upsert(Node::new("gone", NodeType::Task, "tmp")).unwrap();
        store.delete_node("gone").unwrap();
        let report = RelationshipEngine::new(&RelationConfig::default()).process_pending(&store).unwrap();
        assert_eq!(report.entries_seen, 2);
        assert_eq!(report.nodes_processed, 0);
    }
}
