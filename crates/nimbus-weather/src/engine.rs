//! Revalidation protocol: decide, fetch conditionally, and persist.

use std::sync::Arc;

use crate::clock::Clock;
use crate::error::CacheError;
use crate::key::SnapshotKey;
use crate::model::{Snapshot, DEFAULT_TTL_MS, PAYLOAD_VERSION};
use crate::provider::{FetchOutcome, ForecastQuery, ForecastSource, Validators};
use crate::store::SnapshotStore;
use crate::types::Forecast;

/// Result of one revalidation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new payload was stored.
    Updated,
    /// The provider confirmed the cached payload; only freshness moved.
    NotModified,
    /// The cached row was still fresh; no request was made.
    SkippedFresh,
}

/// Whether a row needs a network round trip at `now_ms`.
pub fn needs_refresh(existing: Option<&Snapshot>, now_ms: i64, force: bool) -> bool {
    force || existing.map_or(true, |s| s.is_expired(now_ms))
}

/// Parameters for [`RevalidationEngine::refresh_if_needed`].
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshRequest {
    pub key: SnapshotKey,
    /// Coordinates sent to the provider
    pub lat: f64,
    pub lon: f64,
    pub ttl_ms: i64,
    /// Display overrides; `None` keeps the stored value
    pub city_label: Option<String>,
    pub city_lat: Option<f64>,
    pub city_lon: Option<f64>,
    pub force: bool,
}

impl RefreshRequest {
    pub fn new(key: SnapshotKey, lat: f64, lon: f64) -> Self {
        Self {
            key,
            lat,
            lon,
            ttl_ms: DEFAULT_TTL_MS,
            city_label: None,
            city_lat: None,
            city_lon: None,
            force: false,
        }
    }

    pub fn with_ttl_ms(mut self, ttl_ms: i64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.city_label = Some(label.into());
        self
    }

    pub fn with_city_coords(mut self, lat: f64, lon: f64) -> Self {
        self.city_lat = Some(lat);
        self.city_lon = Some(lon);
        self
    }

    pub fn forced(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

/// Stale-while-revalidate engine over a [`SnapshotStore`].
pub struct RevalidationEngine<S> {
    store: SnapshotStore,
    source: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S> Clone for RevalidationEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            source: self.source.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<S: ForecastSource> RevalidationEngine<S> {
    pub fn new(store: SnapshotStore, source: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, source, clock }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Revalidate one key if it is missing, expired, or `force` is set.
    ///
    /// Nothing is written when an error is returned.
    pub async fn refresh_if_needed(
        &self,
        request: RefreshRequest,
    ) -> Result<RefreshOutcome, CacheError> {
        let now = self.clock.now_ms();
        let existing = self.store.get(&request.key).await?;

        if !needs_refresh(existing.as_ref(), now, request.force) {
            tracing::debug!("Snapshot {} still fresh, skipping", request.key);
            return Ok(RefreshOutcome::SkippedFresh);
        }

        let validators = existing.as_ref().map(Validators::from_snapshot).unwrap_or_default();
        let query = ForecastQuery {
            lat: request.lat,
            lon: request.lon,
            unit: request.key.unit,
        };

        match self.source.fetch(&query, &validators).await? {
            FetchOutcome::NotModified => {
                if existing.is_none() {
                    return Err(CacheError::NotModifiedWithoutSnapshot(request.key.to_string()));
                }
                let touched = self
                    .store
                    .touch_freshness(&request.key, now, now + request.ttl_ms)
                    .await?;
                if !touched {
                    // Row vanished (cleared) while the request was in flight
                    return Err(CacheError::NotModifiedWithoutSnapshot(request.key.to_string()));
                }
                tracing::info!("Snapshot {} not modified, freshness extended", request.key);
                Ok(RefreshOutcome::NotModified)
            }
            FetchOutcome::Fresh(fresh) => {
                let body = fresh.body;
                let (as_of_epoch, body) = tokio::task::spawn_blocking(move || {
                    serde_json::from_slice::<Forecast>(&body).map(|f| (f.as_of_epoch(), body))
                })
                .await?
                .map_err(CacheError::MalformedBody)?;

                let city_label = request
                    .city_label
                    .or_else(|| existing.as_ref().map(|s| s.city_label.clone()))
                    .unwrap_or_else(|| request.key.location_id.to_string());
                let lat = request
                    .city_lat
                    .or_else(|| existing.as_ref().map(|s| s.lat))
                    .unwrap_or(request.lat);
                let lon = request
                    .city_lon
                    .or_else(|| existing.as_ref().map(|s| s.lon))
                    .unwrap_or(request.lon);

                let snapshot = Snapshot {
                    location_id: request.key.location_id.clone(),
                    unit: request.key.unit,
                    as_of_epoch,
                    fetched_at_ms: now,
                    ttl_ms: request.ttl_ms,
                    expires_at_ms: now + request.ttl_ms,
                    etag: fresh.etag,
                    last_modified: fresh.last_modified,
                    city_label,
                    lat,
                    lon,
                    payload: body,
                    payload_version: PAYLOAD_VERSION,
                };
                self.store.upsert(snapshot).await?;
                tracing::info!("Snapshot {} updated (as of {})", request.key, as_of_epoch);
                Ok(RefreshOutcome::Updated)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::clock::ManualClock;
    use crate::db::Database;
    use crate::key::UnitSystem;
    use crate::test_support::ScriptedSource;

    const T0: i64 = 1_700_000_000_000;

    struct Harness {
        engine: RevalidationEngine<ScriptedSource>,
        source: Arc<ScriptedSource>,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let store = SnapshotStore::new(Database::in_memory().unwrap());
        let source = Arc::new(ScriptedSource::new());
        let clock = Arc::new(ManualClock::new(T0));
        let engine = RevalidationEngine::new(store, source.clone(), clock.clone());
        Harness { engine, source, clock }
    }

    fn key() -> SnapshotKey {
        SnapshotKey::for_coords(43.6532, -79.3832, UnitSystem::Metric)
    }

    fn request() -> RefreshRequest {
        RefreshRequest::new(key(), 43.6532, -79.3832)
    }

    #[test]
    fn test_needs_refresh_policy() {
        let snapshot = Snapshot {
            location_id: key().location_id,
            unit: UnitSystem::Metric,
            as_of_epoch: 0,
            fetched_at_ms: 0,
            ttl_ms: 100,
            expires_at_ms: 100,
            etag: None,
            last_modified: None,
            city_label: String::new(),
            lat: 0.0,
            lon: 0.0,
            payload: Vec::new(),
            payload_version: PAYLOAD_VERSION,
        };
        assert!(needs_refresh(None, 0, false));
        assert!(!needs_refresh(Some(&snapshot), 100, false));
        assert!(needs_refresh(Some(&snapshot), 101, false));
        assert!(needs_refresh(Some(&snapshot), 50, true));
    }

    #[tokio::test]
    async fn test_missing_row_is_fetched_and_stored() {
        let h = harness();
        h.source.push_fresh(1_700_000_123, Some("\"v1\""));

        let outcome = h.engine.refresh_if_needed(request()).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Updated);

        let stored = h.engine.store().get(&key()).await.unwrap().unwrap();
        assert_eq!(stored.as_of_epoch, 1_700_000_123);
        assert_eq!(stored.fetched_at_ms, T0);
        assert_eq!(stored.ttl_ms, DEFAULT_TTL_MS);
        assert_eq!(stored.expires_at_ms, T0 + DEFAULT_TTL_MS);
        assert_eq!(stored.etag.as_deref(), Some("\"v1\""));
        assert_eq!(stored.payload_version, PAYLOAD_VERSION);
        // No label anywhere: fall back to the location id
        assert_eq!(stored.city_label, "43.6532,-79.3832");
        assert_eq!((stored.lat, stored.lon), (43.6532, -79.3832));

        assert_eq!(h.source.seen_validators(), vec![Validators::default()]);
        assert_eq!(h.source.seen_queries()[0].unit, UnitSystem::Metric);
    }

    #[tokio::test]
    async fn test_fresh_row_skips_network() {
        let h = harness();
        h.source.push_fresh(1, None);
        h.engine.refresh_if_needed(request()).await.unwrap();

        h.clock.advance(DEFAULT_TTL_MS);
        let outcome = h.engine.refresh_if_needed(request()).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::SkippedFresh);
        assert_eq!(h.source.calls(), 1);
    }

    #[tokio::test]
    async fn test_expired_row_revalidates_with_validators() {
        let h = harness();
        h.source.push_fresh(1, Some("\"v1\""));
        h.engine.refresh_if_needed(request()).await.unwrap();
        let before = h.engine.store().get(&key()).await.unwrap().unwrap();

        h.clock.advance(DEFAULT_TTL_MS + 1);
        h.source.push_not_modified();
        let outcome = h.engine.refresh_if_needed(request()).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::NotModified);

        let seen = h.source.seen_validators();
        assert_eq!(seen[1].etag.as_deref(), Some("\"v1\""));
        assert_eq!(seen[1].last_modified, None);

        let after = h.engine.store().get(&key()).await.unwrap().unwrap();
        let now = T0 + DEFAULT_TTL_MS + 1;
        assert_eq!(after.fetched_at_ms, now);
        assert_eq!(after.expires_at_ms, now + DEFAULT_TTL_MS);
        assert_eq!(after.payload, before.payload);
        assert_eq!(after.etag, before.etag);
        assert_eq!(after.as_of_epoch, before.as_of_epoch);
    }

    #[tokio::test]
    async fn test_not_modified_without_row_is_an_error() {
        let h = harness();
        h.source.push_not_modified();

        let err = h.engine.refresh_if_needed(request()).await.unwrap_err();
        assert!(matches!(err, CacheError::NotModifiedWithoutSnapshot(_)));
        assert!(h.engine.store().get(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_error_status_leaves_row_untouched() {
        let h = harness();
        h.source.push_fresh(1, Some("\"v1\""));
        h.engine.refresh_if_needed(request()).await.unwrap();
        let before = h.engine.store().get(&key()).await.unwrap().unwrap();

        h.source.push_status(500);
        let err = h.engine.refresh_if_needed(request().forced(true)).await.unwrap_err();
        assert!(matches!(err, CacheError::Status { status: 500, .. }));

        let after = h.engine.store().get(&key()).await.unwrap().unwrap();
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn test_malformed_and_empty_bodies_are_rejected() {
        let h = harness();
        h.source.push_body(b"not json");
        h.source.push_body(b"");

        for _ in 0..2 {
            let err = h.engine.refresh_if_needed(request()).await.unwrap_err();
            assert!(matches!(err, CacheError::MalformedBody(_)));
        }
        assert!(h.engine.store().get(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_body_without_current_has_zero_as_of() {
        let h = harness();
        h.source.push_body(br#"{"timezone":"UTC"}"#);

        h.engine.refresh_if_needed(request()).await.unwrap();
        let stored = h.engine.store().get(&key()).await.unwrap().unwrap();
        assert_eq!(stored.as_of_epoch, 0);
    }

    #[tokio::test]
    async fn test_label_precedence() {
        let h = harness();

        h.source.push_fresh(1, None);
        let first = request().with_label("Toronto, CA").with_city_coords(43.65, -79.38);
        h.engine.refresh_if_needed(first).await.unwrap();

        // No override: existing metadata is sticky
        h.source.push_fresh(2, None);
        h.engine.refresh_if_needed(request().forced(true)).await.unwrap();
        let stored = h.engine.store().get(&key()).await.unwrap().unwrap();
        assert_eq!(stored.city_label, "Toronto, CA");
        assert_eq!((stored.lat, stored.lon), (43.65, -79.38));
        assert_eq!(stored.as_of_epoch, 2);

        // Explicit label wins
        h.source.push_fresh(3, None);
        h.engine
            .refresh_if_needed(request().with_label("Downtown").forced(true))
            .await
            .unwrap();
        let stored = h.engine.store().get(&key()).await.unwrap().unwrap();
        assert_eq!(stored.city_label, "Downtown");
    }

    #[tokio::test]
    async fn test_force_on_fresh_row_still_sends_validators() {
        let h = harness();
        h.source.push_fresh(1, Some("\"v1\""));
        h.engine.refresh_if_needed(request()).await.unwrap();

        h.source.push_not_modified();
        let outcome = h.engine.refresh_if_needed(request().forced(true)).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::NotModified);
        assert_eq!(h.source.seen_validators()[1].etag.as_deref(), Some("\"v1\""));
    }

    #[tokio::test]
    async fn test_custom_ttl_is_honored() {
        let h = harness();
        h.source.push_fresh(1, None);
        h.engine.refresh_if_needed(request().with_ttl_ms(60_000)).await.unwrap();

        let stored = h.engine.store().get(&key()).await.unwrap().unwrap();
        assert_eq!(stored.ttl_ms, 60_000);
        assert_eq!(stored.expires_at_ms, T0 + 60_000);

        h.clock.advance(60_001);
        h.source.push_not_modified();
        let outcome = h
            .engine
            .refresh_if_needed(request().with_ttl_ms(60_000))
            .await
            .unwrap();
        assert_eq!(outcome, RefreshOutcome::NotModified);
    }
}
