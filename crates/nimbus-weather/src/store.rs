//! Persisted snapshot store with per-key live observation.
//!
//! Every write publishes the affected key on a broadcast feed. A
//! [`SnapshotWatch`] filters the feed to its own key and re-reads the row, so
//! writes to other keys never wake it. The change is published while the
//! connection lock is still held, which keeps feed order equal to commit order.

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::db::Database;
use crate::error::CacheError;
use crate::key::{LocationId, SnapshotKey, UnitSystem};
use crate::model::Snapshot;

const CHANGE_FEED_CAPACITY: usize = 64;

const SELECT_COLUMNS: &str = "location_id, unit, as_of_epoch, fetched_at_ms, ttl_ms, \
     expires_at_ms, etag, last_modified, city_label, city_lat, city_lon, payload, payload_version";

#[derive(Debug, Clone)]
enum StoreChange {
    Key(SnapshotKey),
    Cleared,
}

#[derive(Clone)]
pub struct SnapshotStore {
    db: Database,
    changes: broadcast::Sender<StoreChange>,
}

impl SnapshotStore {
    pub fn new(db: Database) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self { db, changes }
    }

    pub async fn get(&self, key: &SnapshotKey) -> Result<Option<Snapshot>, CacheError> {
        read_row(&self.db, key.clone()).await
    }

    /// Live view of one key: the current row first, then one emission per
    /// write that touches the key (including `clear`).
    pub fn observe(&self, key: SnapshotKey) -> SnapshotWatch {
        // Subscribe before the priming read so no write can slip between them
        SnapshotWatch {
            key,
            db: self.db.clone(),
            rx: self.changes.subscribe(),
            primed: false,
        }
    }

    /// Insert or replace the row identified by the snapshot's id.
    pub async fn upsert(&self, snapshot: Snapshot) -> Result<(), CacheError> {
        let changes = self.changes.clone();
        self.db
            .run(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO weather_snapshot (snapshot_id, location_id, unit, \
                     as_of_epoch, fetched_at_ms, ttl_ms, expires_at_ms, etag, last_modified, \
                     city_label, city_lat, city_lon, payload, payload_version) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    params![
                        snapshot.snapshot_id(),
                        snapshot.location_id.as_str(),
                        snapshot.unit.as_str(),
                        snapshot.as_of_epoch,
                        snapshot.fetched_at_ms,
                        snapshot.ttl_ms,
                        snapshot.expires_at_ms,
                        snapshot.etag,
                        snapshot.last_modified,
                        snapshot.city_label,
                        snapshot.lat,
                        snapshot.lon,
                        snapshot.payload,
                        snapshot.payload_version,
                    ],
                )?;
                let _ = changes.send(StoreChange::Key(snapshot.key()));
                Ok(())
            })
            .await
    }

    /// Move the freshness window of an existing row without touching its
    /// payload or validators. Returns `false` when no row matched.
    pub async fn touch_freshness(
        &self,
        key: &SnapshotKey,
        fetched_at_ms: i64,
        expires_at_ms: i64,
    ) -> Result<bool, CacheError> {
        let key = key.clone();
        let changes = self.changes.clone();
        self.db
            .run(move |conn| {
                let updated = conn.execute(
                    "UPDATE weather_snapshot \
                     SET fetched_at_ms = ?1, expires_at_ms = ?2, ttl_ms = ?2 - ?1 \
                     WHERE snapshot_id = ?3",
                    params![fetched_at_ms, expires_at_ms, key.snapshot_id()],
                )?;
                if updated > 0 {
                    let _ = changes.send(StoreChange::Key(key));
                }
                Ok(updated > 0)
            })
            .await
    }

    /// Most recently fetched row for `unit`.
    pub async fn latest_for_unit(&self, unit: UnitSystem) -> Result<Option<Snapshot>, CacheError> {
        self.db
            .run(move |conn| {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM weather_snapshot WHERE unit = ?1 \
                     ORDER BY fetched_at_ms DESC LIMIT 1"
                );
                Ok(conn.query_row(&sql, params![unit.as_str()], row_to_snapshot).optional()?)
            })
            .await
    }

    /// Most recently fetched row in any unit.
    pub async fn latest_any(&self) -> Result<Option<Snapshot>, CacheError> {
        self.db
            .run(|conn| {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM weather_snapshot \
                     ORDER BY fetched_at_ms DESC LIMIT 1"
                );
                Ok(conn.query_row(&sql, [], row_to_snapshot).optional()?)
            })
            .await
    }

    pub async fn clear(&self) -> Result<(), CacheError> {
        let changes = self.changes.clone();
        self.db
            .run(move |conn| {
                let removed = conn.execute("DELETE FROM weather_snapshot", [])?;
                tracing::debug!("Cleared {} weather snapshots", removed);
                let _ = changes.send(StoreChange::Cleared);
                Ok(())
            })
            .await
    }
}

/// Live sequence of `Option<Snapshot>` for one key.
///
/// Ends (`None`) once every [`SnapshotStore`] handle has been dropped.
pub struct SnapshotWatch {
    key: SnapshotKey,
    db: Database,
    rx: broadcast::Receiver<StoreChange>,
    primed: bool,
}

impl SnapshotWatch {
    pub fn key(&self) -> &SnapshotKey {
        &self.key
    }

    pub async fn next(&mut self) -> Option<Result<Option<Snapshot>, CacheError>> {
        if !self.primed {
            self.primed = true;
            return Some(read_row(&self.db, self.key.clone()).await);
        }

        loop {
            match self.rx.recv().await {
                Ok(StoreChange::Key(changed)) if changed == self.key => break,
                Ok(StoreChange::Key(_)) => continue,
                Ok(StoreChange::Cleared) => break,
                Err(RecvError::Lagged(skipped)) => {
                    // Missed events may include ours; one re-read catches up
                    tracing::debug!("Snapshot watch for {} lagged by {}", self.key, skipped);
                    break;
                }
                Err(RecvError::Closed) => return None,
            }
        }

        Some(read_row(&self.db, self.key.clone()).await)
    }
}

async fn read_row(db: &Database, key: SnapshotKey) -> Result<Option<Snapshot>, CacheError> {
    db.run(move |conn| select_by_id(conn, &key.snapshot_id())).await
}

fn select_by_id(conn: &Connection, snapshot_id: &str) -> Result<Option<Snapshot>, CacheError> {
    let sql = format!("SELECT {SELECT_COLUMNS} FROM weather_snapshot WHERE snapshot_id = ?1");
    Ok(conn.query_row(&sql, params![snapshot_id], row_to_snapshot).optional()?)
}

fn row_to_snapshot(row: &rusqlite::Row) -> rusqlite::Result<Snapshot> {
    let location_id: String = row.get(0)?;
    let unit_str: String = row.get(1)?;
    let unit = unit_str.parse::<UnitSystem>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Snapshot {
        location_id: LocationId::new(location_id),
        unit,
        as_of_epoch: row.get(2)?,
        fetched_at_ms: row.get(3)?,
        ttl_ms: row.get(4)?,
        expires_at_ms: row.get(5)?,
        etag: row.get(6)?,
        last_modified: row.get(7)?,
        city_label: row.get(8)?,
        lat: row.get(9)?,
        lon: row.get(10)?,
        payload: row.get(11)?,
        payload_version: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use std::time::Duration;

    use super::*;
    use crate::model::{DEFAULT_TTL_MS, PAYLOAD_VERSION};

    fn store() -> SnapshotStore {
        SnapshotStore::new(Database::in_memory().unwrap())
    }

    fn snapshot(lat: f64, lon: f64, unit: UnitSystem, fetched_at_ms: i64) -> Snapshot {
        Snapshot {
            location_id: LocationId::from_coords(lat, lon),
            unit,
            as_of_epoch: 1_700_000_000,
            fetched_at_ms,
            ttl_ms: DEFAULT_TTL_MS,
            expires_at_ms: fetched_at_ms + DEFAULT_TTL_MS,
            etag: Some("\"v1\"".to_string()),
            last_modified: None,
            city_label: "Somewhere".to_string(),
            lat,
            lon,
            payload: br#"{"current":{"dt":1700000000}}"#.to_vec(),
            payload_version: PAYLOAD_VERSION,
        }
    }

    #[tokio::test]
    async fn test_upsert_then_get() {
        let store = store();
        let snap = snapshot(1.0, 2.0, UnitSystem::Metric, 1_000);
        store.upsert(snap.clone()).await.unwrap();

        let loaded = store.get(&snap.key()).await.unwrap().unwrap();
        assert_eq!(loaded, snap);

        let other = SnapshotKey::for_coords(1.0, 2.0, UnitSystem::Imperial);
        assert!(store.get(&other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_replaces_existing_row() {
        let store = store();
        let mut snap = snapshot(1.0, 2.0, UnitSystem::Metric, 1_000);
        store.upsert(snap.clone()).await.unwrap();

        snap.etag = Some("\"v2\"".to_string());
        snap.fetched_at_ms = 2_000;
        snap.expires_at_ms = 2_000 + snap.ttl_ms;
        store.upsert(snap.clone()).await.unwrap();

        let loaded = store.get(&snap.key()).await.unwrap().unwrap();
        assert_eq!(loaded.etag.as_deref(), Some("\"v2\""));
        assert_eq!(loaded.fetched_at_ms, 2_000);
    }

    #[tokio::test]
    async fn test_touch_freshness_keeps_payload_and_validators() {
        let store = store();
        let snap = snapshot(1.0, 2.0, UnitSystem::Metric, 1_000);
        store.upsert(snap.clone()).await.unwrap();

        assert!(store.touch_freshness(&snap.key(), 5_000, 5_000 + 60_000).await.unwrap());

        let loaded = store.get(&snap.key()).await.unwrap().unwrap();
        assert_eq!(loaded.fetched_at_ms, 5_000);
        assert_eq!(loaded.expires_at_ms, 65_000);
        assert_eq!(loaded.expires_at_ms, loaded.fetched_at_ms + loaded.ttl_ms);
        assert_eq!(loaded.payload, snap.payload);
        assert_eq!(loaded.etag, snap.etag);
        assert_eq!(loaded.as_of_epoch, snap.as_of_epoch);
    }

    #[tokio::test]
    async fn test_touch_freshness_without_row() {
        let store = store();
        let key = SnapshotKey::for_coords(1.0, 2.0, UnitSystem::Metric);
        assert!(!store.touch_freshness(&key, 1, 2).await.unwrap());
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_for_unit_filters_by_unit() {
        let store = store();
        store.upsert(snapshot(1.0, 1.0, UnitSystem::Metric, 1_000)).await.unwrap();
        store.upsert(snapshot(2.0, 2.0, UnitSystem::Metric, 3_000)).await.unwrap();
        store.upsert(snapshot(3.0, 3.0, UnitSystem::Imperial, 9_000)).await.unwrap();

        let latest = store.latest_for_unit(UnitSystem::Metric).await.unwrap().unwrap();
        assert_eq!(latest.location_id, LocationId::from_coords(2.0, 2.0));

        let any = store.latest_any().await.unwrap().unwrap();
        assert_eq!(any.unit, UnitSystem::Imperial);

        assert!(store.latest_for_unit(UnitSystem::Standard).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_removes_everything() {
        let store = store();
        let snap = snapshot(1.0, 2.0, UnitSystem::Metric, 1_000);
        store.upsert(snap.clone()).await.unwrap();
        store.clear().await.unwrap();
        assert!(store.get(&snap.key()).await.unwrap().is_none());
        assert!(store.latest_any().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_observe_emits_current_then_updates() {
        let store = store();
        let snap = snapshot(1.0, 2.0, UnitSystem::Metric, 1_000);
        let mut watch = store.observe(snap.key());

        assert_eq!(watch.next().await.unwrap().unwrap(), None);

        store.upsert(snap.clone()).await.unwrap();
        assert_eq!(watch.next().await.unwrap().unwrap(), Some(snap.clone()));

        store.touch_freshness(&snap.key(), 2_000, 3_000).await.unwrap();
        let touched = watch.next().await.unwrap().unwrap().unwrap();
        assert_eq!(touched.fetched_at_ms, 2_000);

        store.clear().await.unwrap();
        assert_eq!(watch.next().await.unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn test_observe_ignores_other_keys() {
        let store = store();
        let watched = snapshot(1.0, 2.0, UnitSystem::Metric, 1_000);
        let mut watch = store.observe(watched.key());
        assert!(watch.next().await.unwrap().unwrap().is_none());

        store.upsert(snapshot(1.0, 2.0, UnitSystem::Imperial, 1_000)).await.unwrap();
        store.upsert(snapshot(5.0, 6.0, UnitSystem::Metric, 1_000)).await.unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(100), watch.next()).await;
        assert!(pending.is_err(), "watch woke up for an unrelated key");
    }

    #[tokio::test]
    async fn test_observe_ends_when_store_dropped() {
        let store = store();
        let mut watch = store.observe(SnapshotKey::for_coords(0.0, 0.0, UnitSystem::Metric));
        watch.next().await.unwrap().unwrap();
        drop(store);
        assert!(watch.next().await.is_none());
    }
}
