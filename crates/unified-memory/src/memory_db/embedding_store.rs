//! Embedding refresh bookkeeping and linear similarity scan.
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::memory_db::change_log;
use crate::memory_db::node_store::{decode_embedding, encode_embedding, validate_embedding};
use crate::memory_db::schema::ChangeKind;
use crate::retrieval::scoring::cosine_similarity;

/// A node whose embedding is missing or out of date.
#[derive(Debug, Clone, Serialize)]
pub struct StaleEmbedding {
    pub node_id: String,
    pub text: String,
    /// Version the text was read at; the refresh is discarded if it moved.
    pub version: i64,
}

/// Write a freshly computed embedding.
///
/// Returns `false` without writing when the node is gone or its version no
/// longer matches `expected_version`. Does not touch `version` or `updated_at`.
pub(crate) fn set_embedding(
    conn: &Connection,
    node_id: &str,
    embedding: &[f32],
    expected_version: Option<i64>,
    dim: usize,
    now: DateTime<Utc>,
) -> Result<bool> {
    validate_embedding(embedding, dim)?;
    let bytes = encode_embedding(embedding)?;
    let updated = conn.execute(
        "UPDATE nodes SET embedding = ?2, embedding_stale = 0
         WHERE id = ?1 AND (?3 IS NULL OR version = ?3)",
        params![node_id, bytes, expected_version],
    )?;
    if updated == 0 {
        debug!(node_id, ?expected_version, "Embedding refresh skipped");
        return Ok(false);
    }
    change_log::append(conn, ChangeKind::EmbeddingUpdated, node_id, None, None, &now)?;
    Ok(true)
}

pub(crate) fn stale_embeddings(conn: &Connection, limit: usize) -> Result<Vec<StaleEmbedding>> {
    let mut stmt = conn.prepare(
        "SELECT id, text, version FROM nodes
         WHERE text != '' AND (embedding_stale = 1 OR embedding IS NULL)
         ORDER BY updated_at ASC, id
         LIMIT ?1",
    )?;
    let rows = stmt.query_map([limit as i64], |row| {
        Ok(StaleEmbedding {
            node_id: row.get(0)?,
            text: row.get(1)?,
            version: row.get(2)?,
        })
    })?;
    let mut stale = Vec::new();
    for row in rows {
        stale.push(row?);
    }
    Ok(stale)
}

/// Nodes whose embedding has cosine similarity above `threshold` with
/// `query`, best first. Nodes with a different dimension are skipped.
pub(crate) fn find_similar(
    conn: &Connection,
    query: &[f32],
    threshold: f32,
    limit: usize,
    exclude_id: Option<&str>,
) -> Result<Vec<(String, f32)>> {
    let mut stmt = conn.prepare("SELECT id, embedding FROM nodes WHERE embedding IS NOT NULL")?;
    let mut rows = stmt.query([])?;

    let mut matches = Vec::new();
    while let Some(row) = rows.next()? {
        let id: String = row.get(0)?;
        if exclude_id == Some(id.as_str()) {
            continue;
        }
        let bytes: Vec<u8> = row.get(1)?;
        let embedding = decode_embedding(&bytes)?;
        if embedding.len() != query.len() {
            continue;
        }
        let sim = cosine_similarity(query, &embedding);
        if sim > threshold {
            matches.push((id, sim));
        }
    }

    matches.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0)));
    matches.truncate(limit);
    Ok(matches)
}
