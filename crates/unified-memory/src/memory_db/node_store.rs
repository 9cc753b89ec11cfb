//! Node persistence: validated upsert with immutable provenance, optimistic
//! versions and stale-embedding tracking.

use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

use crate::error::{MemoryError, Result};
use crate::memory_db::change_log;
use crate::memory_db::schema::{ts_from_sql, ts_to_sql, ChangeKind, Metadata, Node, NodeType};

pub(crate) const MAX_ID_LEN: usize = 256;

pub(crate) const NODE_COLUMNS: &str =
    "id, node_type, text, metadata, repo, author, embedding, embedding_stale, version, created_at, updated_at";

/// What an upsert did to the stored row.
#[derive(Debug, Clone, Serialize)]
pub struct UpsertOutcome {
    pub node: Node,
    pub created: bool,
    /// False when the call left text, metadata and provenance untouched.
    pub changed: bool,
}

pub(crate) fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(MemoryError::invalid("node id must not be empty"));
    }
    if id.len() > MAX_ID_LEN {
        return Err(MemoryError::invalid(format!("node id longer than {} bytes", MAX_ID_LEN)));
    }
    if id.contains('\0') {
        return Err(MemoryError::invalid("node id contains a NUL byte"));
    }
    Ok(())
}

pub(crate) fn validate_embedding(embedding: &[f32], dim: usize) -> Result<()> {
    if embedding.len() != dim {
        return Err(MemoryError::invalid(format!(
            "embedding has {} dimensions, expected {}",
            embedding.len(),
            dim
        )));
    }
    if embedding.iter().any(|v| !v.is_finite()) {
        return Err(MemoryError::invalid("embedding contains non-finite values"));
    }
    Ok(())
}

pub(crate) fn encode_embedding(embedding: &[f32]) -> Result<Vec<u8>> {
    Ok(bincode::serialize(embedding)?)
}

pub(crate) fn decode_embedding(bytes: &[u8]) -> Result<Vec<f32>> {
    Ok(bincode::deserialize(bytes)?)
}

pub(crate) fn row_to_node(row: &Row) -> rusqlite::Result<Node> {
    let node_type: String = row.get(1)?;
    let metadata_raw: String = row.get(3)?;
    let metadata: Metadata = serde_json::from_str(&metadata_raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e)))?;
    let embedding_bytes: Option<Vec<u8>> = row.get(6)?;
    let embedding = match embedding_bytes {
        Some(bytes) => Some(
            bincode::deserialize::<Vec<f32>>(&bytes)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Blob, e))?,
        ),
        None => None,
    };
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;

    Ok(Node {
        id: row.get(0)?,
        node_type: NodeType::parse(&node_type),
        text: row.get(2)?,
        metadata,
        repo: row.get(4)?,
        author: row.get(5)?,
        embedding,
        embedding_stale: row.get(7)?,
        version: row.get(8)?,
        created_at: ts_from_sql(9, &created_at)?,
        updated_at: ts_from_sql(10, &updated_at)?,
    })
}

pub(crate) fn get_node(conn: &Connection, id: &str) -> Result<Option<Node>> {
    let sql = format!("SELECT {} FROM nodes WHERE id = ?1", NODE_COLUMNS);
    Ok(conn.query_row(&sql, [id], row_to_node).optional()?)
}

pub(crate) fn require_node(conn: &Connection, id: &str) -> Result<Node> {
    get_node(conn, id)?.ok_or_else(|| MemoryError::not_found(format!("node '{}'", id)))
}

pub(crate) fn node_exists(conn: &Connection, id: &str) -> Result<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM nodes WHERE id = ?1", [id], |_| Ok(()))
        .optional()?
        .is_some())
}

/// Batch lookup. Missing ids are simply absent from the map.
pub(crate) fn get_nodes(conn: &Connection, ids: &[String]) -> Result<HashMap<String, Node>> {
    let mut nodes = HashMap::with_capacity(ids.len());
    // stay well below SQLITE_MAX_VARIABLE_NUMBER
    for chunk in ids.chunks(500) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!("SELECT {} FROM nodes WHERE id IN ({})", NODE_COLUMNS, placeholders);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(chunk.iter()), row_to_node)?;
        for row in rows {
            let node = row?;
            nodes.insert(node.id.clone(), node);
        }
    }
    Ok(nodes)
}

/// Insert a new node or update text/metadata of an existing one.
///
/// `expected_version` turns the call into a compare-and-set on `version`;
/// `Some(0)` means the node must not exist yet.
pub(crate) fn upsert_node(
    conn: &Connection,
    mut input: Node,
    expected_version: Option<i64>,
    embedding_dim: usize,
    now: DateTime<Utc>,
) -> Result<UpsertOutcome> {
    // stored timestamps carry microseconds; keep the returned node identical to a re-read
    let now = now.trunc_subsecs(6);
    if input.id.is_empty() {
        input.id = uuid::Uuid::new_v4().to_string();
    }
    validate_id(&input.id)?;
    if input.node_type.as_str().is_empty() {
        return Err(MemoryError::invalid("node type must not be empty"));
    }
    if let Some(embedding) = &input.embedding {
        validate_embedding(embedding, embedding_dim)?;
    }

    match get_node(conn, &input.id)? {
        None => insert_node(conn, input, expected_version, now),
        Some(existing) => update_node(conn, existing, input, expected_version, now),
    }
}

fn insert_node(conn: &Connection, mut input: Node, expected_version: Option<i64>, now: DateTime<Utc>) -> Result<UpsertOutcome> {
    if let Some(v) = expected_version {
        if v != 0 {
            return Err(MemoryError::Conflict(format!(
                "node '{}' does not exist, expected version {}",
                input.id, v
            )));
        }
    }

    input.created_at = input.created_at.trunc_subsecs(6).min(now);
    input.updated_at = now;
    input.version = 1;
    input.embedding_stale = false;

    let embedding = input.embedding.as_deref().map(encode_embedding).transpose()?;
    conn.execute(
        "INSERT INTO nodes (id, node_type, text, metadata, repo, author, embedding, embedding_stale, version, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 1, ?8, ?9)",
        params![
            input.id,
            input.node_type.as_str(),
            input.text,
            serde_json::to_string(&input.metadata)?,
            input.repo,
            input.author,
            embedding,
            ts_to_sql(&input.created_at),
            ts_to_sql(&input.updated_at),
        ],
    )?;
    change_log::append(conn, ChangeKind::NodeUpserted, &input.id, None, None, &now)?;
    debug!(node_id = %input.id, node_type = %input.node_type, "Inserted node");

    Ok(UpsertOutcome { node: input, created: true, changed: true })
}

fn update_node(
    conn: &Connection,
    existing: Node,
    input: Node,
    expected_version: Option<i64>,
    now: DateTime<Utc>,
) -> Result<UpsertOutcome> {
    if existing.node_type != input.node_type {
        return Err(MemoryError::ImmutableFieldViolation { id: existing.id, field: "type" });
    }
    let repo = merge_provenance(&existing.id, "repo", &existing.repo, input.repo)?;
    let author = merge_provenance(&existing.id, "author", &existing.author, input.author)?;

    if let Some(v) = expected_version {
        if v != existing.version {
            return Err(MemoryError::Conflict(format!(
                "node '{}' is at version {}, expected {}",
                existing.id, existing.version, v
            )));
        }
    }

    let text_changed = existing.text != input.text;
    let changed = text_changed
        || existing.metadata != input.metadata
        || repo != existing.repo
        || author != existing.author;
    let new_embedding = input.embedding;

    if !changed && new_embedding.is_none() {
        return Ok(UpsertOutcome { node: existing, created: false, changed: false });
    }

    let mut node = existing;
    if changed {
        node.text = input.text;
        node.metadata = input.metadata;
        node.repo = repo;
        node.author = author;
        node.version += 1;
        node.updated_at = now;
        if text_changed {
            node.embedding_stale = true;
        }
    }
    if let Some(embedding) = new_embedding {
        node.embedding = Some(embedding);
        node.embedding_stale = false;
    }

    let embedding = node.embedding.as_deref().map(encode_embedding).transpose()?;
    conn.execute(
        "UPDATE nodes SET text = ?2, metadata = ?3, repo = ?4, author = ?5, embedding = ?6,
                embedding_stale = ?7, version = ?8, updated_at = ?9
         WHERE id = ?1",
        params![
            node.id,
            node.text,
            serde_json::to_string(&node.metadata)?,
            node.repo,
            node.author,
            embedding,
            node.embedding_stale,
            node.version,
            ts_to_sql(&node.updated_at),
        ],
    )?;

    if changed {
        change_log::append(conn, ChangeKind::NodeUpserted, &node.id, None, None, &now)?;
    } else {
        change_log::append(conn, ChangeKind::EmbeddingUpdated, &node.id, None, None, &now)?;
    }
    debug!(node_id = %node.id, version = node.version, changed, "Updated node");

    Ok(UpsertOutcome { node, created: false, changed })
}

/// Provenance may be filled in once; after that it can only be repeated or omitted.
fn merge_provenance(
    id: &str,
    field: &'static str,
    stored: &Option<String>,
    incoming: Option<String>,
) -> Result<Option<String>> {
    match (stored, incoming) {
        (Some(current), Some(new)) if *current != new => {
            Err(MemoryError::ImmutableFieldViolation { id: id.to_string(), field })
        }
        (Some(current), _) => Ok(Some(current.clone())),
        (None, incoming) => Ok(incoming),
    }
}

/// Delete a node; its edges go with it through the foreign keys.
pub(crate) fn delete_node(conn: &Connection, id: &str, now: DateTime<Utc>) -> Result<bool> {
    let removed = conn.execute("DELETE FROM nodes WHERE id = ?1", [id])?;
    if removed > 0 {
        change_log::append(conn, ChangeKind::NodeDeleted, id, None, None, &now)?;
    }
    Ok(removed > 0)
}

/// Merge keys into a node's metadata, bumping version and `updated_at`.
pub(crate) fn patch_metadata(conn: &Connection, id: &str, patch: Metadata, now: DateTime<Utc>) -> Result<Node> {
    let now = now.trunc_subsecs(6);
    let mut node = require_node(conn, id)?;
    let mut metadata = node.metadata.clone();
    for (key, value) in patch {
        metadata.insert(key, value);
    }
    if metadata == node.metadata {
        return Ok(node);
    }
    node.metadata = metadata;
    node.version += 1;
    node.updated_at = now;
    conn.execute(
        "UPDATE nodes SET metadata = ?2, version = ?3, updated_at = ?4 WHERE id = ?1",
        params![node.id, serde_json::to_string(&node.metadata)?, node.version, ts_to_sql(&node.updated_at)],
    )?;
    change_log::append(conn, ChangeKind::NodeUpserted, &node.id, None, None, &now)?;
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::migration::MigrationManager;

    const DIM: usize = 3;

    fn conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        MigrationManager::new(&mut conn).initialize_database().unwrap();
        conn
    }

    #[test]
    fn test_insert_assigns_id_and_version() {
        let conn = conn();
        let out = upsert_node(&conn, Node::new("", NodeType::Task, "write docs"), None, DIM, Utc::now()).unwrap();
        assert!(out.created);
        assert_eq!(out.node.version, 1);
        assert!(uuid::Uuid::parse_str(&out.node.id).is_ok());
        assert_eq!(get_node(&conn, &out.node.id).unwrap().unwrap().text, "write docs");
    }

    #[test]
    fn test_type_change_is_rejected_and_row_kept() {
        let conn = conn();
        upsert_node(&conn, Node::new("d1", NodeType::Decision, "use sqlite"), None, DIM, Utc::now()).unwrap();
        let err = upsert_node(&conn, Node::new("d1", NodeType::Task, "use sqlite"), None, DIM, Utc::now()).unwrap_err();
        assert!(matches!(err, MemoryError::ImmutableFieldViolation { field: "type", .. }));
        assert_eq!(get_node(&conn, "d1").unwrap().unwrap().node_type, NodeType::Decision);
    }

    #[test]
    fn test_provenance_can_be_set_once() {
        let conn = conn();
        upsert_node(&conn, Node::new("n", NodeType::Message, "hi"), None, DIM, Utc::now()).unwrap();
        let out = upsert_node(&conn, Node::new("n", NodeType::Message, "hi").with_repo("core"), None, DIM, Utc::now()).unwrap();
        assert_eq!(out.node.repo.as_deref(), Some("core"));

        // omitting keeps it
        let out = upsert_node(&conn, Node::new("n", NodeType::Message, "hi"), None, DIM, Utc::now()).unwrap();
        assert!(!out.changed);
        assert_eq!(out.node.repo.as_deref(), Some("core"));

        let err = upsert_node(&conn, Node::new("n", NodeType::Message, "hi").with_repo("web"), None, DIM, Utc::now()).unwrap_err();
        assert!(matches!(err, MemoryError::ImmutableFieldViolation { field: "repo", .. }));
    }

    #[test]
    fn test_unchanged_upsert_keeps_timestamps() {
        let conn = conn();
        let first = upsert_node(&conn, Node::new("n", NodeType::Task, "a"), None, DIM, Utc::now()).unwrap();
        let later = first.node.updated_at + chrono::Duration::seconds(30);
        let again = upsert_node(&conn, Node::new("n", NodeType::Task, "a"), None, DIM, later).unwrap();
        assert!(!again.changed);
        assert_eq!(again.node.updated_at, first.node.updated_at);
        assert_eq!(again.node.version, 1);
    }

    #[test]
    fn test_text_change_marks_embedding_stale() {
        let conn = conn();
        let node = Node::new("n", NodeType::Task, "a").with_embedding(vec![1.0, 0.0, 0.0]);
        upsert_node(&conn, node, None, DIM, Utc::now()).unwrap();
        let out = upsert_node(&conn, Node::new("n", NodeType::Task, "b"), None, DIM, Utc::now()).unwrap();
        assert!(out.node.embedding_stale);
        assert_eq!(out.node.version, 2);
        assert!(out.node.embedding.is_some());
    }

    #[test]
    fn test_version_mismatch_is_conflict() {
        let conn = conn();
        upsert_node(&conn, Node::new("n", NodeType::Task, "a"), Some(0), DIM, Utc::now()).unwrap();
        let err = upsert_node(&conn, Node::new("n", NodeType::Task, "b"), Some(5), DIM, Utc::now()).unwrap_err();
        assert!(matches!(err, MemoryError::Conflict(_)));
        upsert_node(&conn, Node::new("n", NodeType::Task, "b"), Some(1), DIM, Utc::now()).unwrap();
    }

    #[test]
    fn test_wrong_embedding_dimension_rejected() {
        let conn = conn();
        let node = Node::new("n", NodeType::Task, "a").with_embedding(vec![1.0]);
        let err = upsert_node(&conn, node, None, DIM, Utc::now()).unwrap_err();
        assert!(matches!(err, MemoryError::InvalidInput(_)));
    }

    #[test]
    fn test_oversized_id_rejected() {
        let conn = conn();
        let id = "x".repeat(MAX_ID_LEN + 1);
        let err = upsert_node(&conn, Node::new(id, NodeType::Task, "a"), None, DIM, Utc::now()).unwrap_err();
        assert!(matches!(err, MemoryError::InvalidInput(_)));
    }
}
