//! Shared SQLite handle for snapshots and favorites.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::CacheError;

const SCHEMA_VERSION: i32 = 1;

/// A single connection behind a mutex. Every query runs on the blocking pool.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CacheError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!("Opened weather database at {} (journal_mode={})", path.display(), mode);

        Self::with_connection(conn)
    }

    /// Create a throwaway in-memory database.
    pub fn in_memory() -> Result<Self, CacheError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, CacheError> {
        init_schema(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Run `f` against the connection on the blocking pool.
    pub(crate) async fn run<T, F>(&self, f: F) -> Result<T, CacheError>
    where
        F: FnOnce(&Connection) -> Result<T, CacheError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await?
    }
}

fn init_schema(conn: &Connection) -> Result<(), CacheError> {
    conn.execute("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)", [])?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()?
        .unwrap_or(0);

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS weather_snapshot (
            snapshot_id TEXT PRIMARY KEY NOT NULL,
            location_id TEXT NOT NULL,
            unit TEXT NOT NULL,
            as_of_epoch INTEGER NOT NULL,
            fetched_at_ms INTEGER NOT NULL,
            ttl_ms INTEGER NOT NULL,
            expires_at_ms INTEGER NOT NULL,
            etag TEXT,
            last_modified TEXT,
            city_label TEXT NOT NULL,
            city_lat REAL NOT NULL,
            city_lon REAL NOT NULL,
            payload BLOB NOT NULL,
            payload_version INTEGER NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_snapshot_location_unit
            ON weather_snapshot(location_id, unit);
        CREATE INDEX IF NOT EXISTS idx_snapshot_unit_fetched
            ON weather_snapshot(unit, fetched_at_ms DESC);

        CREATE TABLE IF NOT EXISTS favorites (
            location_id TEXT PRIMARY KEY NOT NULL,
            city_label TEXT NOT NULL,
            city_lat REAL NOT NULL,
            city_lon REAL NOT NULL,
            last_viewed_ms INTEGER NOT NULL,
            pinned INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_favorites_pinned_viewed
            ON favorites(pinned DESC, last_viewed_ms DESC);
        "#,
    )?;

    if version < SCHEMA_VERSION {
        conn.execute("DELETE FROM schema_version", [])?;
        conn.execute("INSERT INTO schema_version (version) VALUES (?1)", params![SCHEMA_VERSION])?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[tokio::test]
    async fn test_in_memory_schema_version() {
        let db = Database::in_memory().unwrap();
        let version: i32 = db
            .run(|conn| {
                Ok(conn.query_row("SELECT version FROM schema_version", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_open_creates_parent_dir_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("weather.db");

        Database::open(&path).unwrap();
        assert!(path.exists());

        // Second open must not fail on existing tables
        let db = Database::open(&path).unwrap();
        let count: i64 = db
            .run(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
