//! Database migration system

use rusqlite::{Connection, Result};
use tracing::{error, info, warn};

use crate::memory_db::schema;

/// Manages database schema migrations
pub struct MigrationManager<'a> {
    conn: &'a mut Connection,
}

impl<'a> MigrationManager<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    /// Bring the database up to the latest schema version.
    pub fn initialize_database(&mut self) -> Result<()> {
        info!("Initializing memory database schema...");

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        let current_version = self.get_current_version()?;
        info!("Current database schema version: {}", current_version);

        self.apply_migrations(current_version)
    }

    fn apply_migrations(&mut self, current_version: i32) -> Result<()> {
        for (version, migration_sql) in get_migrations() {
            if version <= current_version {
                continue;
            }
            info!("Applying migration {}...", version);

            let tx = self.conn.transaction()?;
            if let Err(e) = tx.execute_batch(migration_sql) {
                error!("Failed to apply migration {}: {}", version, e);
                return Err(e);
            }
            tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
            tx.commit()?;

            info!("Migration {} applied successfully", version);
        }
        Ok(())
    }

    pub fn get_current_version(&self) -> Result<i32> {
        self.conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| row.get(0))
            .or(Ok(0))
    }
}

fn get_migrations() -> Vec<(i32, &'static str)> {
    vec![
        (1, include_str!("migrations/001_initial.sql")),
        (2, include_str!("migrations/002_coordination.sql")),
        (3, include_str!("migrations/003_path_index.sql")),
    ]
}

/// Row counts and on-disk size. Read-only.
pub fn get_database_stats(conn: &Connection) -> Result<schema::StoreStats> {
    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |row| row.get(0)).unwrap_or_else(|e| {
            warn!("Stats query failed ({}): {}", sql, e);
            0
        })
    }

    let database_size_bytes: i64 = conn
        .query_row(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(schema::StoreStats {
        total_nodes: count(conn, "SELECT COUNT(*) FROM nodes"),
        total_edges: count(conn, "SELECT COUNT(*) FROM edges"),
        total_sessions: count(conn, "SELECT COUNT(*) FROM sessions"),
        total_leases: count(conn, "SELECT COUNT(*) FROM leases"),
        stale_embeddings: count(
            conn,
            "SELECT COUNT(*) FROM nodes WHERE embedding_stale = 1 OR (embedding IS NULL AND text != '')",
        ),
        change_log_head: count(conn, super::change_log::HEAD_SQL),
        database_size_bytes,
    })
}

/// ANALYZE plus an integrity check; used by the admin endpoint.
pub fn run_maintenance(conn: &mut Connection) -> Result<()> {
    info!("Running database maintenance...");
    conn.execute_batch("ANALYZE")?;
    conn.execute_batch("PRAGMA integrity_check")?;
    info!("Database maintenance completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_apply_once() {
        let mut conn = Connection::open_in_memory().unwrap();
        MigrationManager::new(&mut conn).initialize_database().unwrap();
        // second run is a no-op
        MigrationManager::new(&mut conn).initialize_database().unwrap();

        assert_eq!(MigrationManager::new(&mut conn).get_current_version().unwrap(), 3);
        let applied: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(applied, 3);
    }

    #[test]
    fn test_single_writer_index_rejects_second_writer() {
        let mut conn = Connection::open_in_memory().unwrap();
        MigrationManager::new(&mut conn).initialize_database().unwrap();
        let insert = "INSERT INTO leases (resource_key, holder_instance_id, mode, acquired_at, expires_at)
                      VALUES (?1, ?2, 'write', '2024-01-01T00:00:00.000000Z', '2024-01-01T00:01:00.000000Z')";
        conn.execute(insert, ["file.py", "a"]).unwrap();
        assert!(conn.execute(insert, ["file.py", "b"]).is_err());
    }
}
