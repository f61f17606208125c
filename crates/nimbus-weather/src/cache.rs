//! Wiring for the snapshot cache: one database shared by every component.

use std::path::Path;
use std::sync::Arc;

use crate::clock::Clock;
use crate::conditions::{DeviceConditions, PowerPolicy};
use crate::db::Database;
use crate::engine::RevalidationEngine;
use crate::error::CacheError;
use crate::fanout::FanoutRefresher;
use crate::favorites::FavoriteStore;
use crate::projector::Projector;
use crate::provider::ForecastSource;
use crate::store::SnapshotStore;

pub struct WeatherCache<S> {
    snapshots: SnapshotStore,
    favorites: FavoriteStore,
    engine: RevalidationEngine<S>,
    projector: Projector,
    fanout: FanoutRefresher<S>,
}

impl<S> Clone for WeatherCache<S> {
    fn clone(&self) -> Self {
        Self {
            snapshots: self.snapshots.clone(),
            favorites: self.favorites.clone(),
            engine: self.engine.clone(),
            projector: self.projector.clone(),
            fanout: self.fanout.clone(),
        }
    }
}

impl<S: ForecastSource> WeatherCache<S> {
    pub fn new(
        db: Database,
        source: Arc<S>,
        clock: Arc<dyn Clock>,
        conditions: Arc<dyn DeviceConditions>,
        policy: PowerPolicy,
        ttl_ms: i64,
    ) -> Self {
        let snapshots = SnapshotStore::new(db.clone());
        let favorites = FavoriteStore::new(db);
        let engine = RevalidationEngine::new(snapshots.clone(), source, clock);
        let projector = Projector::new(snapshots.clone());
        let fanout = FanoutRefresher::new(engine.clone(), conditions, policy).with_ttl_ms(ttl_ms);
        Self { snapshots, favorites, engine, projector, fanout }
    }

    /// Open the database file at `path` and wire everything to it.
    pub fn open(
        path: &Path,
        source: Arc<S>,
        clock: Arc<dyn Clock>,
        conditions: Arc<dyn DeviceConditions>,
        policy: PowerPolicy,
        ttl_ms: i64,
    ) -> Result<Self, CacheError> {
        let db = Database::open(path)?;
        tracing::info!("Weather cache opened at {}", path.display());
        Ok(Self::new(db, source, clock, conditions, policy, ttl_ms))
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn favorites(&self) -> &FavoriteStore {
        &self.favorites
    }

    pub fn engine(&self) -> &RevalidationEngine<S> {
        &self.engine
    }

    pub fn projector(&self) -> &Projector {
        &self.projector
    }

    pub fn fanout(&self) -> &FanoutRefresher<S> {
        &self.fanout
    }

    /// Remove every snapshot and favorite.
    pub async fn clear(&self) -> Result<(), CacheError> {
        self.snapshots.clear().await?;
        self.favorites.clear().await
    }
}
