//! Session and lease rows. Grant decisions live in the coordinator; this
//! module only reads and writes inside the caller's transaction.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{MemoryError, Result};
use crate::memory_db::schema::{ts_from_sql, ts_to_sql, Lease, LeaseMode, Session, SessionState};

const SESSION_COLUMNS: &str = "instance_id, role, workspace_path, state, registered_at, last_heartbeat";
const LEASE_COLUMNS: &str = "resource_key, holder_instance_id, mode, acquired_at, expires_at";

fn row_to_session(row: &Row) -> rusqlite::Result<Session> {
    let state_raw: String = row.get(3)?;
    let state = SessionState::parse(&state_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown session state '{}'", state_raw).into(),
        )
    })?;
    let registered_at: String = row.get(4)?;
    let last_heartbeat: String = row.get(5)?;
    Ok(Session {
        instance_id: row.get(0)?,
        role: row.get(1)?,
        workspace_path: row.get(2)?,
        state,
        active_leases: Vec::new(),
        registered_at: ts_from_sql(4, &registered_at)?,
        last_heartbeat: ts_from_sql(5, &last_heartbeat)?,
    })
}

fn row_to_lease(row: &Row) -> rusqlite::Result<Lease> {
    let mode_raw: String = row.get(2)?;
    let mode = LeaseMode::parse(&mode_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown lease mode '{}'", mode_raw).into(),
        )
    })?;
    let acquired_at: String = row.get(3)?;
    let expires_at: String = row.get(4)?;
    Ok(Lease {
        resource_key: row.get(0)?,
        holder_instance_id: row.get(1)?,
        mode,
        acquired_at: ts_from_sql(3, &acquired_at)?,
        expires_at: ts_from_sql(4, &expires_at)?,
    })
}

fn held_keys(conn: &Connection, holder: &str, now: &DateTime<Utc>) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT resource_key FROM leases
         WHERE holder_instance_id = ?1 AND expires_at > ?2
         ORDER BY resource_key",
    )?;
    let rows = stmt.query_map(params![holder, ts_to_sql(now)], |row| row.get::<_, String>(0))?;
    let mut keys = Vec::new();
    for row in rows {
        keys.push(row?);
    }
    Ok(keys)
}

pub(crate) fn get_session(conn: &Connection, instance_id: &str, now: &DateTime<Utc>) -> Result<Option<Session>> {
    let sql = format!("SELECT {} FROM sessions WHERE instance_id = ?1", SESSION_COLUMNS);
    match conn.query_row(&sql, [instance_id], row_to_session).optional()? {
        Some(mut session) => {
            session.active_leases = held_keys(conn, instance_id, now)?;
            Ok(Some(session))
        }
        None => Ok(None),
    }
}

pub(crate) fn list_sessions(conn: &Connection, now: &DateTime<Utc>) -> Result<Vec<Session>> {
    let sql = format!("SELECT {} FROM sessions ORDER BY registered_at, instance_id", SESSION_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], row_to_session)?;
    let mut sessions = Vec::new();
    for row in rows {
        let mut session = row?;
        session.active_leases = held_keys(conn, &session.instance_id, now)?;
        sessions.push(session);
    }
    Ok(sessions)
}

pub(crate) fn insert_session(
    conn: &Connection,
    instance_id: &str,
    role: &str,
    workspace_path: &str,
    now: &DateTime<Utc>,
) -> Result<()> {
    let ts = ts_to_sql(now);
    conn.execute(
        "INSERT INTO sessions (instance_id, role, workspace_path, state, registered_at, last_heartbeat, stale_since)
         VALUES (?1, ?2, ?3, 'active', ?4, ?4, NULL)",
        params![instance_id, role, workspace_path, ts],
    )?;
    Ok(())
}

/// Refresh the heartbeat and put the session back to `active`.
pub(crate) fn touch_session(conn: &Connection, instance_id: &str, now: &DateTime<Utc>) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE sessions SET last_heartbeat = ?2, state = 'active', stale_since = NULL WHERE instance_id = ?1",
        params![instance_id, ts_to_sql(now)],
    )?;
    Ok(updated > 0)
}

pub(crate) fn delete_session(conn: &Connection, instance_id: &str) -> Result<bool> {
    Ok(conn.execute("DELETE FROM sessions WHERE instance_id = ?1", [instance_id])? > 0)
}

/// Flip every active session whose heartbeat is older than `cutoff` to stale.
pub(crate) fn mark_overdue_stale(conn: &Connection, cutoff: &DateTime<Utc>, now: &DateTime<Utc>) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "UPDATE sessions SET state = 'stale', stale_since = ?2
         WHERE state = 'active' AND last_heartbeat < ?1
         RETURNING instance_id",
    )?;
    let rows = stmt.query_map(params![ts_to_sql(cutoff), ts_to_sql(now)], |row| row.get::<_, String>(0))?;
    let mut ids = Vec::new();
    for row in rows {
        ids.push(row?);
    }
    ids.sort();
    Ok(ids)
}

/// Sessions that are stale and still overdue, with the time they went stale.
pub(crate) fn overdue_stale_sessions(conn: &Connection, cutoff: &DateTime<Utc>) -> Result<Vec<(String, DateTime<Utc>)>> {
    let mut stmt = conn.prepare(
        "SELECT instance_id, stale_since FROM sessions
         WHERE state = 'stale' AND last_heartbeat < ?1 AND stale_since IS NOT NULL
         ORDER BY instance_id",
    )?;
    let rows = stmt.query_map([ts_to_sql(cutoff)], |row| {
        let since: String = row.get(1)?;
        Ok((row.get::<_, String>(0)?, ts_from_sql(1, &since)?))
    })?;
    let mut sessions = Vec::new();
    for row in rows {
        sessions.push(row?);
    }
    Ok(sessions)
}

/// Drop expired leases, for one key or for all keys.
pub(crate) fn purge_expired(conn: &Connection, resource_key: Option<&str>, now: &DateTime<Utc>) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM leases WHERE expires_at <= ?1 AND (?2 IS NULL OR resource_key = ?2)",
        params![ts_to_sql(now), resource_key],
    )?)
}

/// Unexpired leases on a key.
pub(crate) fn leases_for(conn: &Connection, resource_key: &str, now: &DateTime<Utc>) -> Result<Vec<Lease>> {
    let sql = format!(
        "SELECT {} FROM leases WHERE resource_key = ?1 AND expires_at > ?2 ORDER BY acquired_at, holder_instance_id",
        LEASE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![resource_key, ts_to_sql(now)], row_to_lease)?;
    let mut leases = Vec::new();
    for row in rows {
        leases.push(row?);
    }
    Ok(leases)
}

pub(crate) fn get_lease(conn: &Connection, resource_key: &str, holder: &str, now: &DateTime<Utc>) -> Result<Option<Lease>> {
    let sql = format!(
        "SELECT {} FROM leases WHERE resource_key = ?1 AND holder_instance_id = ?2 AND expires_at > ?3",
        LEASE_COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![resource_key, holder, ts_to_sql(now)], row_to_lease)
        .optional()?)
}

/// Insert or overwrite the holder's lease on a key.
pub(crate) fn put_lease(conn: &Connection, lease: &Lease) -> Result<()> {
    let result = conn.execute(
        "INSERT INTO leases (resource_key, holder_instance_id, mode, acquired_at, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(resource_key, holder_instance_id) DO UPDATE SET
             mode = excluded.mode, acquired_at = excluded.acquired_at, expires_at = excluded.expires_at",
        params![
            lease.resource_key,
            lease.holder_instance_id,
            lease.mode.as_str(),
            ts_to_sql(&lease.acquired_at),
            ts_to_sql(&lease.expires_at),
        ],
    );
    match result {
        Ok(_) => Ok(()),
        // the single-writer index is the last line against a double grant
        Err(rusqlite::Error::SqliteFailure(err, _)) if err.code == rusqlite::ErrorCode::ConstraintViolation => {
            Err(MemoryError::Conflict(format!(
                "write lease on '{}' already granted",
                lease.resource_key
            )))
        }
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn delete_lease(conn: &Connection, resource_key: &str, holder: &str) -> Result<bool> {
    Ok(conn.execute(
        "DELETE FROM leases WHERE resource_key = ?1 AND holder_instance_id = ?2",
        params![resource_key, holder],
    )? > 0)
}

pub(crate) fn renew_all(conn: &Connection, holder: &str, now: &DateTime<Utc>, expires_at: &DateTime<Utc>) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE leases SET expires_at = ?3 WHERE holder_instance_id = ?1 AND expires_at > ?2",
        params![holder, ts_to_sql(now), ts_to_sql(expires_at)],
    )?)
}

pub(crate) fn release_all(conn: &Connection, holder: &str) -> Result<usize> {
    Ok(conn.execute("DELETE FROM leases WHERE holder_instance_id = ?1", [holder])?)
}

/// Release the holder's leases acquired at or before `snapshot`. Leases
/// granted after the snapshot belong to a revived session and are kept.
pub(crate) fn release_acquired_before(conn: &Connection, holder: &str, snapshot: &DateTime<Utc>) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "DELETE FROM leases WHERE holder_instance_id = ?1 AND acquired_at <= ?2 RETURNING resource_key",
    )?;
    let rows = stmt.query_map(params![holder, ts_to_sql(snapshot)], |row| row.get::<_, String>(0))?;
    let mut keys = Vec::new();
    for row in rows {
        keys.push(row?);
    }
    keys.sort();
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::migration::MigrationManager;
    use chrono::Duration;

    fn conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        MigrationManager::new(&mut conn).initialize_database().unwrap();
        conn
    }

    fn lease(key: &str, holder: &str, mode: LeaseMode, now: DateTime<Utc>) -> Lease {
        Lease {
            resource_key: key.into(),
            holder_instance_id: holder.into(),
            mode,
            acquired_at: now,
            expires_at: now + Duration::seconds(60),
        }
    }

    #[test]
    fn test_session_lists_only_unexpired_leases() {
        let conn = conn();
        let now = Utc::now();
        insert_session(&conn, "a", "builder", "/ws", &now).unwrap();
        put_lease(&conn, &lease("x.rs", "a", LeaseMode::Write, now)).unwrap();
        let mut old = lease("y.rs", "a", LeaseMode::Read, now - Duration::seconds(120));
        old.expires_at = now - Duration::seconds(1);
        put_lease(&conn, &old).unwrap();

        let session = get_session(&conn, "a", &now).unwrap().unwrap();
        assert_eq!(session.active_leases, vec!["x.rs".to_string()]);
        assert_eq!(purge_expired(&conn, None, &now).unwrap(), 1);
    }

    #[test]
    fn test_second_writer_is_conflict() {
        let conn = conn();
        let now = Utc::now();
        put_lease(&conn, &lease("x.rs", "a", LeaseMode::Write, now)).unwrap();
        let err = put_lease(&conn, &lease("x.rs", "b", LeaseMode::Write, now)).unwrap_err();
        assert!(matches!(err, MemoryError::Conflict(_)));
    }

    #[test]
    fn test_stale_marking_and_snapshot_release() {
        let conn = conn();
        let t0 = Utc::now() - Duration::seconds(300);
        insert_session(&conn, "a", "r", "/ws", &t0).unwrap();
        put_lease(&conn, &lease("x.rs", "a", LeaseMode::Write, t0)).unwrap();

        let now = Utc::now();
        let cutoff = now - Duration::seconds(60);
        assert_eq!(mark_overdue_stale(&conn, &cutoff, &now).unwrap(), vec!["a".to_string()]);
        assert!(mark_overdue_stale(&conn, &cutoff, &now).unwrap().is_empty());

        let stale = overdue_stale_sessions(&conn, &cutoff).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(release_acquired_before(&conn, "a", &stale[0].1).unwrap(), vec!["x.rs".to_string()]);
        assert!(release_acquired_before(&conn, "a", &stale[0].1).unwrap().is_empty());
    }
}
