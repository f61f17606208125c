//! Persisted records.

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::key::{LocationId, SnapshotKey, UnitSystem};

/// Default freshness window: 15 minutes.
pub const DEFAULT_TTL_MS: i64 = 15 * 60 * 1000;

/// Version tag written next to every payload. Rows carrying any other
/// version are treated as unreadable.
pub const PAYLOAD_VERSION: u32 = 1;

/// The last successful response for one location in one unit system,
/// together with its freshness window and validators.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub location_id: LocationId,
    pub unit: UnitSystem,
    /// Provider-reported recency in epoch seconds (0 if unknown)
    pub as_of_epoch: i64,
    pub fetched_at_ms: i64,
    pub ttl_ms: i64,
    /// Always `fetched_at_ms + ttl_ms`
    pub expires_at_ms: i64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub city_label: String,
    pub lat: f64,
    pub lon: f64,
    /// Raw response body
    pub payload: Vec<u8>,
    pub payload_version: u32,
}

impl Snapshot {
    pub fn key(&self) -> SnapshotKey {
        SnapshotKey::new(self.location_id.clone(), self.unit)
    }

    pub fn snapshot_id(&self) -> String {
        self.key().snapshot_id()
    }

    /// A snapshot is still fresh at exactly `expires_at_ms`.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms > self.expires_at_ms
    }
}

/// A saved place kept warm by the fan-out refresher.
#[derive(Debug, Clone, PartialEq)]
pub struct Favorite {
    pub location_id: LocationId,
    pub city_label: String,
    pub lat: f64,
    pub lon: f64,
    pub last_viewed_ms: i64,
    pub pinned: bool,
}

impl Favorite {
    pub fn new(city_label: impl Into<String>, lat: f64, lon: f64, last_viewed_ms: i64) -> Self {
        Self {
            location_id: LocationId::from_coords(lat, lon),
            city_label: city_label.into(),
            lat,
            lon,
            last_viewed_ms,
            pinned: false,
        }
    }

    pub fn pinned(mut self, pinned: bool) -> Self {
        self.pinned = pinned;
        self
    }
}

/// The most recently displayed place, persisted across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastLocation {
    pub location_id: LocationId,
    #[serde(default)]
    pub unit: UnitSystem,
    #[serde(default)]
    pub city_label: String,
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub seen_at_ms: i64,
}

impl LastLocation {
    /// `key` as seen now, stamped with the clock's current time.
    pub fn seen(
        key: &SnapshotKey,
        city_label: impl Into<String>,
        lat: f64,
        lon: f64,
        clock: &dyn Clock,
    ) -> Self {
        Self {
            location_id: key.location_id.clone(),
            unit: key.unit,
            city_label: city_label.into(),
            lat,
            lon,
            seen_at_ms: clock.now_ms(),
        }
    }

    pub fn key(&self) -> SnapshotKey {
        SnapshotKey::new(self.location_id.clone(), self.unit)
    }
}
