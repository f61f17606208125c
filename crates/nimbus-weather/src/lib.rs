//! Offline-first weather snapshot cache for Nimbus.
//!
//! Readers are served from SQLite immediately while revalidation runs in the
//! background with conditional requests (stale-while-revalidate). A bounded
//! fan-out pass keeps favorite locations warm when the device allows it.

pub mod cache;
pub mod clock;
pub mod conditions;
pub mod db;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod favorites;
pub mod key;
pub mod last_location;
pub mod location;
pub mod model;
pub mod projector;
pub mod provider;
pub mod session;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use cache::WeatherCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use conditions::{
    allows_background_refresh, DeviceConditions, NetworkStatus, PowerPolicy, PowerStatus, StaticConditions,
    SysfsConditions, Transport,
};
pub use db::Database;
pub use engine::{needs_refresh, RefreshOutcome, RefreshRequest, RevalidationEngine};
pub use error::{CacheError, DecodeError};
pub use fanout::{FanoutRefresher, FanoutReport, DEFAULT_MAX_PARALLEL};
pub use favorites::FavoriteStore;
pub use key::{LocationId, SnapshotKey, UnitSystem};
pub use last_location::LastLocationStore;
pub use location::{FixedLocation, GeoPoint, LocationProvider};
pub use model::{Favorite, LastLocation, Snapshot, DEFAULT_TTL_MS, PAYLOAD_VERSION};
pub use projector::{decode, ForecastMeta, ForecastWatch, ForecastWithMeta, Projection, Projector};
pub use provider::{FetchOutcome, ForecastQuery, ForecastSource, FreshBody, OneCallClient, Validators};
pub use session::{
    Binding, RefreshHandle, SessionSettings, ViewState, WeatherSession, CURRENT_LOCATION_LABEL,
};
pub use store::{SnapshotStore, SnapshotWatch};
pub use types::{Forecast, WeatherCondition};
