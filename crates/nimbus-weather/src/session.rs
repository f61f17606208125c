//! Session coordinator: binds one location at a time and drives the view.
//!
//! Binding a location seeds the view from cache, keeps observing the stored
//! snapshot, remembers the place as the last location whenever data is shown,
//! and revalidates in the background. Existing data is never replaced by a
//! loading or error state.

use std::sync::Arc;

use nimbus_core::Config;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::WeatherCache;
use crate::clock::Clock;
use crate::engine::{RefreshOutcome, RefreshRequest};
use crate::error::CacheError;
use crate::fanout::DEFAULT_MAX_PARALLEL;
use crate::key::{LocationId, SnapshotKey, UnitSystem};
use crate::last_location::LastLocationStore;
use crate::location::LocationProvider;
use crate::model::{Favorite, LastLocation, DEFAULT_TTL_MS};
use crate::projector::{ForecastWatch, ForecastWithMeta};
use crate::provider::ForecastSource;

/// Label used when binding to a live location fix.
pub const CURRENT_LOCATION_LABEL: &str = "Current location";

/// Background revalidation started by a bind or favorite action.
pub type RefreshHandle = JoinHandle<Result<RefreshOutcome, CacheError>>;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub ttl_ms: i64,
    pub max_parallel: usize,
    pub fallback_label: String,
    pub fallback_lat: f64,
    pub fallback_lon: f64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl_ms: DEFAULT_TTL_MS,
            max_parallel: DEFAULT_MAX_PARALLEL,
            fallback_label: "Toronto, CA".to_string(),
            fallback_lat: 43.6532,
            fallback_lon: -79.3832,
        }
    }
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ttl_ms: config.weather.ttl_ms(),
            max_parallel: config.refresh.max_parallel,
            fallback_label: config.fallback.label.clone(),
            fallback_lat: config.fallback.lat,
            fallback_lon: config.fallback.lon,
        }
    }
}

/// What a reader should display.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ViewState {
    #[default]
    Idle,
    /// Nothing cached yet; a request is in flight.
    Loading,
    HasData(ForecastWithMeta),
    /// Nothing cached and the request failed.
    Error(String),
}

impl ViewState {
    pub fn has_data(&self) -> bool {
        matches!(self, Self::HasData(_))
    }

    pub fn data(&self) -> Option<&ForecastWithMeta> {
        match self {
            Self::HasData(value) => Some(value),
            _ => None,
        }
    }
}

/// The location a session is currently showing.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub key: SnapshotKey,
    pub lat: f64,
    pub lon: f64,
    pub label: Option<String>,
}

/// Cancels its binding's background work when dropped.
struct ObservationHandle {
    token: CancellationToken,
}

impl Drop for ObservationHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[derive(Default)]
struct SessionState {
    binding: Option<Binding>,
    observation: Option<ObservationHandle>,
}

type SharedState = Arc<Mutex<SessionState>>;

/// Publishes to the view and the last location on behalf of one binding.
///
/// A rebind cancels the token while holding the session lock, and every
/// publish re-checks the token under that same lock (or, for the last
/// location, under the store's write lock), so a superseded binding can never
/// overwrite its successor.
#[derive(Clone)]
struct BindingPublisher {
    key: SnapshotKey,
    token: CancellationToken,
    state: SharedState,
    view: Arc<watch::Sender<ViewState>>,
    last: LastLocationStore,
    clock: Arc<dyn Clock>,
}

impl BindingPublisher {
    async fn show(&self, value: ForecastWithMeta) {
        let meta = &value.meta;
        let record = LastLocation::seen(
            &self.key,
            meta.city_label.clone(),
            meta.lat,
            meta.lon,
            self.clock.as_ref(),
        );
        {
            let _state = self.state.lock();
            if self.token.is_cancelled() {
                return;
            }
            self.view.send_replace(ViewState::HasData(value));
        }

        let token = self.token.clone();
        if let Err(e) = self.last.save_if(record, move || !token.is_cancelled()).await {
            tracing::warn!("Could not save last location: {}", e);
        }
    }

    /// Nothing readable is cached for this key.
    fn show_missing(&self, keep_current_data: bool) {
        let _state = self.state.lock();
        if self.token.is_cancelled() {
            return;
        }
        self.view.send_if_modified(|view| {
            if keep_current_data && view.has_data() {
                false
            } else {
                *view = ViewState::Loading;
                true
            }
        });
    }

    fn show_error(&self, err: &CacheError) {
        let _state = self.state.lock();
        if !self.token.is_cancelled() {
            publish_error(&self.view, err);
        }
    }
}

pub struct WeatherSession<S, L> {
    cache: WeatherCache<S>,
    last: LastLocationStore,
    location: Arc<L>,
    settings: SessionSettings,
    state: SharedState,
    view: Arc<watch::Sender<ViewState>>,
}

impl<S: ForecastSource, L: LocationProvider> WeatherSession<S, L> {
    pub fn new(
        cache: WeatherCache<S>,
        last: LastLocationStore,
        location: Arc<L>,
        settings: SessionSettings,
    ) -> Self {
        let (view, _) = watch::channel(ViewState::Idle);
        Self {
            cache,
            last,
            location,
            settings,
            state: Arc::new(Mutex::new(SessionState::default())),
            view: Arc::new(view),
        }
    }

    pub fn cache(&self) -> &WeatherCache<S> {
        &self.cache
    }

    pub fn last_location(&self) -> &LastLocationStore {
        &self.last
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewState> {
        self.view.subscribe()
    }

    pub fn view(&self) -> ViewState {
        self.view.borrow().clone()
    }

    pub fn binding(&self) -> Option<Binding> {
        self.state.lock().binding.clone()
    }

    /// Cold start: the last shown place if there is one, otherwise
    /// [`bind_current`](Self::bind_current).
    pub async fn bind_from_last_or_current(&self, unit: UnitSystem) -> RefreshHandle {
        if let Some(last) = self.last.read_once().await {
            tracing::debug!("Restoring last location {}", last.location_id);
            let label = (!last.city_label.is_empty()).then(|| last.city_label.clone());
            return self.bind_key(Binding {
                key: last.key(),
                lat: last.lat,
                lon: last.lon,
                label,
            });
        }
        self.bind_current(unit).await
    }

    /// Live fix if available, else the newest cached row for `unit`, else the
    /// configured fallback place.
    pub async fn bind_current(&self, unit: UnitSystem) -> RefreshHandle {
        if let Some(fix) = self.location.current_fix().await {
            return self.bind_location(fix.lat, fix.lon, unit, Some(CURRENT_LOCATION_LABEL.to_string()));
        }

        match self.cache.snapshots().latest_for_unit(unit).await {
            Ok(Some(row)) => {
                tracing::debug!("No location fix, using latest cached {}", row.key());
                return self.bind_key(Binding {
                    key: row.key(),
                    lat: row.lat,
                    lon: row.lon,
                    label: Some(row.city_label),
                });
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Could not read latest snapshot: {}", e),
        }

        let fallback = &self.settings;
        self.bind_location(
            fallback.fallback_lat,
            fallback.fallback_lon,
            unit,
            Some(fallback.fallback_label.clone()),
        )
    }

    /// Bind to a specific place (favorite, search result, coordinates).
    pub fn bind_location(
        &self,
        lat: f64,
        lon: f64,
        unit: UnitSystem,
        label: Option<String>,
    ) -> RefreshHandle {
        self.bind_key(Binding {
            key: SnapshotKey::for_coords(lat, lon, unit),
            lat,
            lon,
            label,
        })
    }

    fn bind_key(&self, binding: Binding) -> RefreshHandle {
        let token = CancellationToken::new();
        let same_key = {
            let mut state = self.state.lock();
            // Replacing the handle cancels the previous binding
            state.observation = Some(ObservationHandle { token: token.clone() });
            let previous = state.binding.replace(binding.clone());
            previous.is_some_and(|b| b.key == binding.key)
        };
        tracing::info!("Bound session to {}", binding.key);

        let publisher = BindingPublisher {
            key: binding.key.clone(),
            token,
            state: self.state.clone(),
            view: self.view.clone(),
            last: self.last.clone(),
            clock: self.cache.engine().clock().clone(),
        };
        let projector = self.cache.projector().clone();
        let engine = self.cache.engine().clone();
        let favorites = self.cache.favorites().clone();
        let request = self.request_for(&binding, false);

        let handle = tokio::spawn(async move {
            // The cache decides what is shown before the network is consulted
            let mut watch = projector.observe_with_meta(publisher.key.clone());
            match watch.next().await.flatten() {
                Some(value) => publisher.show(value).await,
                None => publisher.show_missing(same_key),
            }
            tokio::spawn(observe(watch, publisher.clone()));

            let location_id = &publisher.key.location_id;
            match favorites.touch(location_id, publisher.clock.now_ms()).await {
                Ok(true) => tracing::debug!("Favorite {} marked as viewed", location_id),
                Ok(false) => {}
                Err(e) => tracing::warn!("Could not update favorite {}: {}", location_id, e),
            }

            let result = engine.refresh_if_needed(request).await;
            match &result {
                Ok(outcome) => tracing::debug!("Revalidated {}: {:?}", publisher.key, outcome),
                Err(e) => {
                    tracing::warn!("Revalidation of {} failed: {}", publisher.key, e);
                    publisher.show_error(e);
                }
            }
            result
        });

        self.spawn_favorites_warmup(binding.key.unit);
        handle
    }

    /// Revalidate the bound location. `Ok(None)` when nothing is bound.
    pub async fn refresh(&self, force: bool) -> Result<Option<RefreshOutcome>, CacheError> {
        let Some(binding) = self.binding() else {
            return Ok(None);
        };
        let request = self.request_for(&binding, force);
        match self.cache.engine().refresh_if_needed(request).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) => {
                tracing::warn!("Refresh of {} failed: {}", binding.key, e);
                let state = self.state.lock();
                if state.binding.as_ref().is_some_and(|b| b.key == binding.key) {
                    publish_error(&self.view, &e);
                }
                Err(e)
            }
        }
    }

    /// Save a place and start a forced background refresh for it.
    pub async fn add_favorite(
        &self,
        lat: f64,
        lon: f64,
        label: &str,
        unit: UnitSystem,
    ) -> Result<RefreshHandle, CacheError> {
        let now = self.cache.engine().clock().now_ms();
        let location_id = LocationId::from_coords(lat, lon);
        let pinned = self
            .cache
            .favorites()
            .get(&location_id)
            .await?
            .is_some_and(|existing| existing.pinned);

        self.cache
            .favorites()
            .upsert(Favorite {
                location_id: location_id.clone(),
                city_label: label.to_string(),
                lat,
                lon,
                last_viewed_ms: now,
                pinned,
            })
            .await?;
        tracing::info!("Added favorite {} ({})", label, location_id);

        let request = RefreshRequest::new(SnapshotKey::new(location_id, unit), lat, lon)
            .with_ttl_ms(self.settings.ttl_ms)
            .with_label(label)
            .with_city_coords(lat, lon)
            .forced(true);
        let engine = self.cache.engine().clone();
        Ok(tokio::spawn(async move {
            let result = engine.refresh_if_needed(request).await;
            if let Err(e) = &result {
                tracing::debug!("Background refresh for new favorite failed: {}", e);
            }
            result
        }))
    }

    /// Stop observing and return to [`ViewState::Idle`].
    pub fn unbind(&self) {
        {
            let mut state = self.state.lock();
            state.observation = None;
            state.binding = None;
        }
        self.view.send_replace(ViewState::Idle);
    }

    /// Forget everything: snapshots, favorites and the last location.
    pub async fn clear_all_data(&self) -> Result<(), CacheError> {
        self.unbind();
        self.cache.clear().await?;
        self.last.clear().await?;
        tracing::info!("Cleared all weather data");
        Ok(())
    }

    fn request_for(&self, binding: &Binding, force: bool) -> RefreshRequest {
        let mut request = RefreshRequest::new(binding.key.clone(), binding.lat, binding.lon)
            .with_ttl_ms(self.settings.ttl_ms)
            .with_city_coords(binding.lat, binding.lon)
            .forced(force);
        if let Some(label) = &binding.label {
            request = request.with_label(label.clone());
        }
        request
    }

    fn spawn_favorites_warmup(&self, unit: UnitSystem) {
        let favorites = self.cache.favorites().clone();
        let fanout = self.cache.fanout().clone();
        let max_parallel = self.settings.max_parallel;

        tokio::spawn(async move {
            match favorites.list().await {
                Ok(list) => {
                    fanout.refresh_favorites_if_allowed(&list, unit, max_parallel, false).await;
                }
                Err(e) => tracing::warn!("Could not list favorites: {}", e),
            }
        });
    }
}

/// Follow one key until the binding is cancelled or the store goes away.
async fn observe(mut watch: ForecastWatch, publisher: BindingPublisher) {
    loop {
        let next = tokio::select! {
            _ = publisher.token.cancelled() => break,
            next = watch.next() => next,
        };
        let Some(item) = next else { break };
        // Missing or unreadable rows leave the view as it is
        if let Some(value) = item {
            publisher.show(value).await;
        }
    }
    tracing::debug!("Stopped observing {}", publisher.key);
}

fn publish_error(view: &watch::Sender<ViewState>, err: &CacheError) {
    view.send_if_modified(|state| {
        if state.has_data() {
            false
        } else {
            *state = ViewState::Error(err.user_message());
            true
        }
    });
}
