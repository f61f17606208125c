//! Bounded background refresh of favorite locations.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::conditions::{allows_background_refresh, DeviceConditions, PowerPolicy};
use crate::engine::{needs_refresh, RefreshOutcome, RefreshRequest, RevalidationEngine};
use crate::key::{SnapshotKey, UnitSystem};
use crate::model::{Favorite, DEFAULT_TTL_MS};
use crate::provider::ForecastSource;

pub const DEFAULT_MAX_PARALLEL: usize = 3;

/// Tally of one fan-out pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// The device gate refused the whole batch.
    pub gated: bool,
    pub fresh: usize,
    pub updated: usize,
    pub not_modified: usize,
    pub failed: usize,
}

impl FanoutReport {
    pub fn attempted(&self) -> usize {
        self.updated + self.not_modified + self.failed
    }
}

pub struct FanoutRefresher<S> {
    engine: RevalidationEngine<S>,
    conditions: Arc<dyn DeviceConditions>,
    policy: PowerPolicy,
    ttl_ms: i64,
}

impl<S> Clone for FanoutRefresher<S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            conditions: self.conditions.clone(),
            policy: self.policy,
            ttl_ms: self.ttl_ms,
        }
    }
}

impl<S: ForecastSource> FanoutRefresher<S> {
    pub fn new(
        engine: RevalidationEngine<S>,
        conditions: Arc<dyn DeviceConditions>,
        policy: PowerPolicy,
    ) -> Self {
        Self { engine, conditions, policy, ttl_ms: DEFAULT_TTL_MS }
    }

    pub fn with_ttl_ms(mut self, ttl_ms: i64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    /// Revalidate every favorite that needs it, at most `max_parallel` at a
    /// time. Skips the whole batch when the device gate says no. Per-item
    /// failures are logged and counted, never returned.
    pub async fn refresh_favorites_if_allowed(
        &self,
        favorites: &[Favorite],
        unit: UnitSystem,
        max_parallel: usize,
        force: bool,
    ) -> FanoutReport {
        let mut report = FanoutReport::default();
        if favorites.is_empty() {
            return report;
        }

        let conditions = self.conditions.clone();
        let policy = self.policy;
        let allowed = tokio::task::spawn_blocking(move || {
            allows_background_refresh(conditions.as_ref(), policy)
        })
        .await
        .unwrap_or(false);
        if !allowed {
            tracing::info!("Skipping favorites refresh for {} places", favorites.len());
            report.gated = true;
            return report;
        }

        let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
        let now = self.engine.clock().now_ms();
        let mut tasks = JoinSet::new();

        for favorite in favorites {
            let key = SnapshotKey::new(favorite.location_id.clone(), unit);

            // Fresh rows never take a slot
            match self.engine.store().get(&key).await {
                Ok(existing) if !needs_refresh(existing.as_ref(), now, force) => {
                    report.fresh += 1;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Could not read snapshot {}: {}", key, e);
                    report.failed += 1;
                    continue;
                }
            }

            let request = RefreshRequest::new(key, favorite.lat, favorite.lon)
                .with_ttl_ms(self.ttl_ms)
                .with_label(favorite.city_label.clone())
                .with_city_coords(favorite.lat, favorite.lon)
                .forced(force);
            let engine = self.engine.clone();
            let semaphore = semaphore.clone();

            tasks.spawn(async move {
                // Released on drop, whatever the outcome
                let _permit = semaphore.acquire_owned().await.ok();
                let key = request.key.clone();
                (key, engine.refresh_if_needed(request).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(RefreshOutcome::Updated))) => report.updated += 1,
                Ok((_, Ok(RefreshOutcome::NotModified))) => report.not_modified += 1,
                Ok((_, Ok(RefreshOutcome::SkippedFresh))) => report.fresh += 1,
                Ok((key, Err(e))) => {
                    tracing::warn!("Favorite refresh failed for {}: {}", key, e);
                    report.failed += 1;
                }
                Err(e) => {
                    tracing::warn!("Favorite refresh task failed: {}", e);
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            "Favorites refresh done: {} updated, {} not modified, {} fresh, {} failed",
            report.updated,
            report.not_modified,
            report.fresh,
            report.failed
        );
        report
    }
}
