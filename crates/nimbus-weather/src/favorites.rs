//! Saved places.

use rusqlite::{params, OptionalExtension};

use crate::db::Database;
use crate::error::CacheError;
use crate::key::LocationId;
use crate::model::Favorite;

const SELECT_COLUMNS: &str = "location_id, city_label, city_lat, city_lon, last_viewed_ms, pinned";

#[derive(Clone)]
pub struct FavoriteStore {
    db: Database,
}

impl FavoriteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn upsert(&self, favorite: Favorite) -> Result<(), CacheError> {
        self.db
            .run(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO favorites \
                     (location_id, city_label, city_lat, city_lon, last_viewed_ms, pinned) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        favorite.location_id.as_str(),
                        favorite.city_label,
                        favorite.lat,
                        favorite.lon,
                        favorite.last_viewed_ms,
                        favorite.pinned as i32,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Returns `true` if a favorite was removed.
    pub async fn remove(&self, location_id: &LocationId) -> Result<bool, CacheError> {
        let id = location_id.as_str().to_string();
        self.db
            .run(move |conn| {
                Ok(conn.execute("DELETE FROM favorites WHERE location_id = ?1", params![id])? > 0)
            })
            .await
    }

    pub async fn get(&self, location_id: &LocationId) -> Result<Option<Favorite>, CacheError> {
        let id = location_id.as_str().to_string();
        self.db
            .run(move |conn| {
                let sql = format!("SELECT {SELECT_COLUMNS} FROM favorites WHERE location_id = ?1");
                Ok(conn.query_row(&sql, params![id], row_to_favorite).optional()?)
            })
            .await
    }

    pub async fn exists(&self, location_id: &LocationId) -> Result<bool, CacheError> {
        let id = location_id.as_str().to_string();
        self.db
            .run(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM favorites WHERE location_id = ?1",
                    params![id],
                    |row| row.get(0),
                )?;
                Ok(count > 0)
            })
            .await
    }

    /// Record that a favorite was just viewed.
    pub async fn touch(&self, location_id: &LocationId, viewed_at_ms: i64) -> Result<bool, CacheError> {
        let id = location_id.as_str().to_string();
        self.db
            .run(move |conn| {
                let updated = conn.execute(
                    "UPDATE favorites SET last_viewed_ms = ?1 WHERE location_id = ?2",
                    params![viewed_at_ms, id],
                )?;
                Ok(updated > 0)
            })
            .await
    }

    /// Returns `false` when there is no such favorite.
    pub async fn set_pinned(&self, location_id: &LocationId, pinned: bool) -> Result<bool, CacheError> {
        let id = location_id.as_str().to_string();
        self.db
            .run(move |conn| {
                let updated = conn.execute(
                    "UPDATE favorites SET pinned = ?1 WHERE location_id = ?2",
                    params![pinned as i32, id],
                )?;
                Ok(updated > 0)
            })
            .await
    }

    /// Pinned first, then most recently viewed.
    pub async fn list(&self) -> Result<Vec<Favorite>, CacheError> {
        self.db
            .run(|conn| {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM favorites ORDER BY pinned DESC, last_viewed_ms DESC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let favorites = stmt
                    .query_map([], row_to_favorite)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(favorites)
            })
            .await
    }

    pub async fn clear(&self) -> Result<(), CacheError> {
        self.db
            .run(|conn| {
                conn.execute("DELETE FROM favorites", [])?;
                Ok(())
            })
            .await
    }
}

fn row_to_favorite(row: &rusqlite::Row) -> rusqlite::Result<Favorite> {
    let location_id: String = row.get(0)?;
    let pinned: i32 = row.get(5)?;
    Ok(Favorite {
        location_id: LocationId::new(location_id),
        city_label: row.get(1)?,
        lat: row.get(2)?,
        lon: row.get(3)?,
        last_viewed_ms: row.get(4)?,
        pinned: pinned != 0,
    })
}
