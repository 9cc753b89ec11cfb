//! Typed directed edges, unique per (from, to, relation).

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{MemoryError, Result};
use crate::memory_db::change_log;
use crate::memory_db::node_store;
use crate::memory_db::schema::{ts_from_sql, ts_to_sql, ChangeKind, Edge};

pub(crate) const MAX_RELATION_LEN: usize = 64;

fn row_to_edge(row: &Row) -> rusqlite::Result<Edge> {
    let metadata_raw: Option<String> = row.get(3)?;
    let metadata = match metadata_raw {
        Some(raw) => Some(
            serde_json::from_str::<Value>(&raw)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e)))?,
        ),
        None => None,
    };
    let created_at: String = row.get(4)?;
    Ok(Edge {
        from_id: row.get(0)?,
        to_id: row.get(1)?,
        relation: row.get(2)?,
        metadata,
        created_at: ts_from_sql(4, &created_at)?,
    })
}

pub(crate) fn validate_relation(relation: &str) -> Result<()> {
    if relation.is_empty() || relation.chars().count() > MAX_RELATION_LEN {
        return Err(MemoryError::invalid(format!(
            "relation must be 1..={} characters",
            MAX_RELATION_LEN
        )));
    }
    Ok(())
}

/// Create the edge, or overwrite its metadata if it already exists.
/// `created_at` of an existing edge is preserved.
pub(crate) fn link(
    conn: &Connection,
    from_id: &str,
    to_id: &str,
    relation: &str,
    metadata: Option<Value>,
    now: DateTime<Utc>,
) -> Result<Edge> {
    validate_relation(relation)?;
    for id in [from_id, to_id] {
        if !node_store::node_exists(conn, id)? {
            return Err(MemoryError::not_found(format!("node '{}'", id)));
        }
    }

    let metadata_json = metadata.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO edges (from_id, to_id, relation, metadata, created_at) VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(from_id, to_id, relation) DO UPDATE SET metadata = excluded.metadata",
        params![from_id, to_id, relation, metadata_json, ts_to_sql(&now)],
    )?;
    let edge = conn.query_row(
        "SELECT from_id, to_id, relation, metadata, created_at FROM edges
         WHERE from_id = ?1 AND to_id = ?2 AND relation = ?3",
        params![from_id, to_id, relation],
        row_to_edge,
    )?;
    change_log::append(conn, ChangeKind::EdgeLinked, from_id, Some(to_id), Some(relation), &now)?;
    Ok(edge)
}

pub(crate) fn unlink(conn: &Connection, from_id: &str, to_id: &str, relation: &str, now: DateTime<Utc>) -> Result<bool> {
    let removed = conn.execute(
        "DELETE FROM edges WHERE from_id = ?1 AND to_id = ?2 AND relation = ?3",
        params![from_id, to_id, relation],
    )?;
    if removed > 0 {
        change_log::append(conn, ChangeKind::EdgeUnlinked, from_id, Some(to_id), Some(relation), &now)?;
    }
    Ok(removed > 0)
}

/// Every edge touching `id`, in either direction.
pub(crate) fn edges_of(conn: &Connection, id: &str) -> Result<Vec<Edge>> {
    let mut stmt = conn.prepare(
        "SELECT from_id, to_id, relation, metadata, created_at FROM edges
         WHERE from_id = ?1 OR to_id = ?1
         ORDER BY created_at ASC, from_id, to_id, relation",
    )?;
    let rows = stmt.query_map([id], row_to_edge)?;
    let mut edges = Vec::new();
    for row in rows {
        edges.push(row?);
    }
    Ok(edges)
}

pub(crate) fn outgoing(conn: &Connection, id: &str, relation: Option<&str>) -> Result<Vec<Edge>> {
    let mut stmt = conn.prepare(
        "SELECT from_id, to_id, relation, metadata, created_at FROM edges
         WHERE from_id = ?1 AND (?2 IS NULL OR relation = ?2)
         ORDER BY to_id, relation",
    )?;
    let rows = stmt.query_map(params![id, relation], row_to_edge)?;
    let mut edges = Vec::new();
    for row in rows {
        edges.push(row?);
    }
    Ok(edges)
}

pub(crate) fn incoming(conn: &Connection, id: &str, relation: Option<&str>) -> Result<Vec<Edge>> {
    let mut stmt = conn.prepare(
        "SELECT from_id, to_id, relation, metadata, created_at FROM edges
         WHERE to_id = ?1 AND (?2 IS NULL OR relation = ?2)
         ORDER BY from_id, relation",
    )?;
    let rows = stmt.query_map(params![id, relation], row_to_edge)?;
    let mut edges = Vec::new();
    for row in rows {
        edges.push(row?);
    }
    Ok(edges)
}

/// In + out degree of every node that has at least one edge.
/// A self-loop counts twice, once per endpoint.
pub(crate) fn degree_map(conn: &Connection) -> Result<HashMap<String, i64>> {
    let mut stmt = conn.prepare(
        "SELECT id, COUNT(*) FROM (
             SELECT from_id AS id FROM edges
             UNION ALL
             SELECT to_id AS id FROM edges
         ) GROUP BY id",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
    let mut degrees = HashMap::new();
    for row in rows {
        let (id, degree) = row?;
        degrees.insert(id, degree);
    }
    Ok(degrees)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::migration::MigrationManager;
    use crate::memory_db::schema::{Node, NodeType};

    fn conn_with_nodes(ids: &[&str]) -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        MigrationManager::new(&mut conn).initialize_database().unwrap();
        for id in ids {
            node_store::upsert_node(&conn, Node::new(*id, NodeType::Task, *id), None, 3, Utc::now()).unwrap();
        }
        conn
    }

    #[test]
    fn test_link_twice_keeps_one_edge_with_latest_metadata() {
        let conn = conn_with_nodes(&["a", "b"]);
        let first = link(&conn, "a", "b", "touches", Some(serde_json::json!({"n": 1})), Utc::now()).unwrap();
        let later = first.created_at + chrono::Duration::seconds(5);
        let second = link(&conn, "a", "b", "touches", Some(serde_json::json!({"n": 2})), later).unwrap();

        assert_eq!(edges_of(&conn, "a").unwrap().len(), 1);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.metadata, Some(serde_json::json!({"n": 2})));
    }

    #[test]
    fn test_link_to_missing_node_is_not_found() {
        let conn = conn_with_nodes(&["a"]);
        let err = link(&conn, "a", "ghost", "touches", None, Utc::now()).unwrap_err();
        assert!(matches!(err, MemoryError::NotFound(msg) if msg.contains("ghost")));
    }

    #[test]
    fn test_deleting_node_cascades_edges() {
        let conn = conn_with_nodes(&["a", "b"]);
        link(&conn, "a", "b", "touches", None, Utc::now()).unwrap();
        node_store::delete_node(&conn, "b", Utc::now()).unwrap();
        assert!(edges_of(&conn, "a").unwrap().is_empty());
    }

    #[test]
    fn test_self_loop_degree() {
        let conn = conn_with_nodes(&["a", "b"]);
        link(&conn, "a", "a", "refines", None, Utc::now()).unwrap();
        link(&conn, "a", "b", "touches", None, Utc::now()).unwrap();
        let degrees = degree_map(&conn).unwrap();
        assert_eq!(degrees["a"], 3);
        assert_eq!(degrees["b"], 1);
    }

    #[test]
    fn test_empty_relation_rejected() {
        let conn = conn_with_nodes(&["a", "b"]);
        assert!(matches!(link(&conn, "a", "b", "", None, Utc::now()), Err(MemoryError::InvalidInput(_))));
    }
}
