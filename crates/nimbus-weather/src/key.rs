//! Typed cache keys.
//!
//! A location is identified by `"lat,lon"` with both coordinates formatted to
//! [`LOCATION_PRECISION`] decimal digits, and a snapshot by
//! `"<location>|<unit>"`.

use std::fmt;
use std::str::FromStr;

use nimbus_core::UnitPreference;
use serde::{Deserialize, Serialize};

/// Decimal digits kept per coordinate in a [`LocationId`] (about 11 m).
pub const LOCATION_PRECISION: usize = 4;

/// Unit system requested from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnitSystem {
    #[default]
    Metric,
    Imperial,
    Standard,
}

impl UnitSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Metric => "metric",
            Self::Imperial => "imperial",
            Self::Standard => "standard",
        }
    }
}

impl fmt::Display for UnitSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown unit system: {0}")]
pub struct UnknownUnit(pub String);

impl FromStr for UnitSystem {
    type Err = UnknownUnit;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "metric" => Ok(Self::Metric),
            "imperial" => Ok(Self::Imperial),
            "standard" => Ok(Self::Standard),
            other => Err(UnknownUnit(other.to_string())),
        }
    }
}

impl From<UnitPreference> for UnitSystem {
    fn from(pref: UnitPreference) -> Self {
        match pref {
            UnitPreference::Metric => Self::Metric,
            UnitPreference::Imperial => Self::Imperial,
            UnitPreference::Standard => Self::Standard,
        }
    }
}

impl From<UnitSystem> for UnitPreference {
    fn from(unit: UnitSystem) -> Self {
        match unit {
            UnitSystem::Metric => Self::Metric,
            UnitSystem::Imperial => Self::Imperial,
            UnitSystem::Standard => Self::Standard,
        }
    }
}

/// Stable identifier for a geographic point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationId(String);

impl LocationId {
    /// Wrap a caller-supplied identifier as-is.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build the canonical `"lat,lon"` identifier.
    ///
    /// Coordinates are rounded half away from zero, and a value that rounds to
    /// zero is written without a sign, so `-0.00001` and `0.0` share a key.
    pub fn from_coords(lat: f64, lon: f64) -> Self {
        Self(format!("{},{}", format_coord(lat), format_coord(lon)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn format_coord(value: f64) -> String {
    let scale = 10f64.powi(LOCATION_PRECISION as i32);
    let rounded = (value * scale).round() / scale;
    let rounded = if rounded == 0.0 { 0.0 } else { rounded };
    format!("{:.*}", LOCATION_PRECISION, rounded)
}

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one snapshot row: a location in a unit system.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotKey {
    pub location_id: LocationId,
    pub unit: UnitSystem,
}

impl SnapshotKey {
    pub fn new(location_id: LocationId, unit: UnitSystem) -> Self {
        Self { location_id, unit }
    }

    pub fn for_coords(lat: f64, lon: f64, unit: UnitSystem) -> Self {
        Self::new(LocationId::from_coords(lat, lon), unit)
    }

    /// Composite primary key, `"<location>|<unit>"`.
    pub fn snapshot_id(&self) -> String {
        format!("{}|{}", self.location_id, self.unit)
    }
}

impl fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.location_id, self.unit)
    }
}
