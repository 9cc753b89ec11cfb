//! Append-only change log and per-consumer cursors.
//!
//! Every graph mutation appends one row inside the same transaction as the
//! mutation itself, so a committed change is always visible to consumers and a
//! rolled-back one never is.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{MemoryError, Result};
use crate::memory_db::schema::{ts_from_sql, ts_to_sql, ChangeEntry, ChangeKind};

pub(crate) fn append(
    conn: &Connection,
    kind: ChangeKind,
    node_id: &str,
    related_id: Option<&str>,
    relation: Option<&str>,
    now: &DateTime<Utc>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO change_log (kind, node_id, related_id, relation, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![kind.as_str(), node_id, related_id, relation, ts_to_sql(now)],
    )?;
    Ok(conn.last_insert_rowid())
}

/// `seq` is AUTOINCREMENT, so `sqlite_sequence` keeps the high-water mark
/// even after compaction has removed every row.
pub(crate) const HEAD_SQL: &str =
    "SELECT COALESCE((SELECT seq FROM sqlite_sequence WHERE name = 'change_log'), 0)";

/// Highest sequence number written so far, 0 when nothing was ever written.
pub(crate) fn head(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row(HEAD_SQL, [], |row| row.get(0))?)
}

/// Drop entries every registered consumer has already read. Without any
/// cursor nothing is removed.
pub(crate) fn compact(conn: &Connection) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM change_log WHERE seq <= (SELECT MIN(last_seq) FROM consumer_cursors)",
        [],
    )?)
}

/// Entries with `seq > after`, oldest first.
pub(crate) fn changes_since(conn: &Connection, after: i64, limit: usize) -> Result<Vec<ChangeEntry>> {
    let mut stmt = conn.prepare(
        "SELECT seq, kind, node_id, related_id, relation, created_at
         FROM change_log WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![after, limit as i64], row_to_entry)?;
    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}

fn row_to_entry(row: &Row) -> rusqlite::Result<ChangeEntry> {
    let kind_raw: String = row.get(1)?;
    let kind = ChangeKind::parse(&kind_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown change kind '{}'", kind_raw).into(),
        )
    })?;
    let created_at: String = row.get(5)?;
    Ok(ChangeEntry {
        seq: row.get(0)?,
        kind,
        node_id: row.get(2)?,
        related_id: row.get(3)?,
        relation: row.get(4)?,
        created_at: ts_from_sql(5, &created_at)?,
    })
}

pub(crate) fn get_cursor(conn: &Connection, consumer: &str) -> Result<i64> {
    let seq = conn
        .query_row(
            "SELECT last_seq FROM consumer_cursors WHERE consumer = ?1",
            [consumer],
            |row| row.get(0),
        )
        .optional()?;
    Ok(seq.unwrap_or(0))
}

/// Cursors only move forward.
pub(crate) fn set_cursor(conn: &Connection, consumer: &str, seq: i64, now: &DateTime<Utc>) -> Result<()> {
    if consumer.is_empty() {
        return Err(MemoryError::invalid("consumer name must not be empty"));
    }
    conn.execute(
        "INSERT INTO consumer_cursors (consumer, last_seq, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(consumer) DO UPDATE SET
             last_seq = MAX(consumer_cursors.last_seq, excluded.last_seq),
             updated_at = excluded.updated_at",
        params![consumer, seq, ts_to_sql(now)],
    )?;
    Ok(())
}
