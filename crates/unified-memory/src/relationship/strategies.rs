//! Edge inference strategies. Each one looks at a freshly written node and
//! proposes edges from it to nodes already in the store.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use serde_json::{json, Value};

use crate::error::Result;
use crate::memory_db::embedding_store;
use crate::memory_db::node_store::{row_to_node, NODE_COLUMNS};
use crate::memory_db::schema::{ts_to_sql, Node};

pub const RELATION_CO_OCCURRED: &str = "co-occurred";
pub const RELATION_TOUCHES: &str = "touches";
pub const RELATION_RELATED_TO: &str = "related_to";

#[derive(Debug, Clone, PartialEq)]
pub struct ProposedLink {
    pub to_id: String,
    pub relation: &'static str,
    pub metadata: Value,
}

pub trait InferenceStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Edges from `node` to other nodes. Never proposes `node` itself.
    fn propose(&self, conn: &Connection, node: &Node) -> Result<Vec<ProposedLink>>;
}

/// Links to `task`/`session` nodes whose active window, widened by
/// `window`, contains the new node's creation time.
pub struct TemporalProximity {
    pub window: Duration,
}

fn metadata_time(node: &Node, key: &str) -> Option<DateTime<Utc>> {
    node.metadata_str(key)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Start and end of a task/session window in SQL, with the same fallbacks
/// as `metadata_time`: non-text or unparseable bounds use the row timestamps.
const WINDOW_START_SQL: &str = "COALESCE(julianday(CASE WHEN json_type(metadata, '$.started_at') = 'text'
     THEN json_extract(metadata, '$.started_at') END), julianday(created_at))";
const WINDOW_END_SQL: &str = "COALESCE(julianday(CASE WHEN json_type(metadata, '$.ended_at') = 'text'
     THEN json_extract(metadata, '$.ended_at') END), julianday(updated_at))";

impl TemporalProximity {
    /// Task and session rows whose widened window may contain `node`.
    /// Bounds get a second of slack for julianday rounding; `propose`
    /// applies the exact check.
    fn candidates(&self, conn: &Connection, node: &Node) -> Result<Vec<Node>> {
        let slack = self.window + Duration::seconds(1);
        let sql = format!(
            "SELECT {} FROM nodes
             WHERE node_type IN ('task', 'session') AND id != ?1
               AND {start} <= julianday(?2)
               AND MAX({end}, {start}) >= julianday(?3)
             ORDER BY id",
            NODE_COLUMNS,
            start = WINDOW_START_SQL,
            end = WINDOW_END_SQL,
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![node.id, ts_to_sql(&(node.created_at + slack)), ts_to_sql(&(node.created_at - slack))],
            row_to_node,
        )?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(row?);
        }
        Ok(nodes)
    }
}

impl InferenceStrategy for TemporalProximity {
    fn name(&self) -> &'static str {
        "temporal"
    }

    fn propose(&self, conn: &Connection, node: &Node) -> Result<Vec<ProposedLink>> {
        let at = node.created_at;
        let mut links = Vec::new();
        for other in self.candidates(conn, node)? {
            let start = metadata_time(&other, "started_at").unwrap_or(other.created_at);
            let end = metadata_time(&other, "ended_at").unwrap_or(other.updated_at).max(start);
            if at < start - self.window || at > end + self.window {
                continue;
            }
            let gap = if at < start {
                (start - at).num_seconds()
            } else if at > end {
                (at - end).num_seconds()
            } else {
                0
            };
            links.push(ProposedLink {
                to_id: other.id,
                relation: RELATION_CO_OCCURRED,
                metadata: json!({ "strategy": self.name(), "gap_seconds": gap }),
            });
        }
        Ok(links)
    }
}

/// Links to `file` nodes that share the new node's `metadata.path`.
pub struct SharedFile;

impl InferenceStrategy for SharedFile {
    fn name(&self) -> &'static str {
        "shared_file"
    }

    fn propose(&self, conn: &Connection, node: &Node) -> Result<Vec<ProposedLink>> {
        let Some(path) = node.metadata_str("path").filter(|p| !p.is_empty()) else {
            return Ok(Vec::new());
        };
        let mut stmt = conn.prepare(
            "SELECT id FROM nodes
             WHERE node_type = 'file' AND json_extract(metadata, '$.path') = ?1 AND id != ?2
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![path, node.id], |row| row.get::<_, String>(0))?;
        let mut links = Vec::new();
        for row in rows {
            links.push(ProposedLink {
                to_id: row?,
                relation: RELATION_TOUCHES,
                metadata: json!({ "strategy": self.name(), "path": path }),
            });
        }
        Ok(links)
    }
}

/// Links to the most similar embedded nodes above `threshold`.
pub struct SemanticSimilarity {
    pub threshold: f32,
    pub max_links: usize,
}

impl InferenceStrategy for SemanticSimilarity {
    fn name(&self) -> &'static str {
        "semantic"
    }

    fn propose(&self, conn: &Connection, node: &Node) -> Result<Vec<ProposedLink>> {
        let Some(embedding) = node.embedding.as_deref() else {
            return Ok(Vec::new());
        };
        if node.embedding_stale || self.max_links == 0 {
            return Ok(Vec::new());
        }
        let similar = embedding_store::find_similar(conn, embedding, self.threshold, self.max_links, Some(&node.id))?;
        Ok(similar
            .into_iter()
            .map(|(id, similarity)| ProposedLink {
                to_id: id,
                relation: RELATION_RELATED_TO,
                metadata: json!({ "strategy": self.name(), "similarity": similarity }),
            })
            .collect())
    }
}
