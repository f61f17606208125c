//! Read model: stored snapshots decoded into forecasts plus display metadata.

use crate::error::{CacheError, DecodeError};
use crate::key::SnapshotKey;
use crate::model::{Snapshot, PAYLOAD_VERSION};
use crate::store::{SnapshotStore, SnapshotWatch};
use crate::types::Forecast;

#[derive(Debug, Clone, PartialEq)]
pub struct ForecastMeta {
    pub city_label: String,
    pub lat: f64,
    pub lon: f64,
    pub as_of_epoch: i64,
    pub fetched_at_ms: i64,
}

impl From<&Snapshot> for ForecastMeta {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            city_label: snapshot.city_label.clone(),
            lat: snapshot.lat,
            lon: snapshot.lon,
            as_of_epoch: snapshot.as_of_epoch,
            fetched_at_ms: snapshot.fetched_at_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForecastWithMeta {
    pub forecast: Forecast,
    pub meta: ForecastMeta,
}

/// Outcome of projecting one key.
#[derive(Debug)]
pub enum Projection {
    Missing,
    Corrupt(DecodeError),
    Ready(ForecastWithMeta),
}

impl Projection {
    /// Collapse to the reader-facing shape: both missing and corrupt are `None`.
    pub fn into_option(self) -> Option<ForecastWithMeta> {
        match self {
            Self::Ready(value) => Some(value),
            Self::Missing | Self::Corrupt(_) => None,
        }
    }
}

/// Decode a stored payload. CPU-bound; call from the blocking pool.
pub fn decode(snapshot: &Snapshot) -> Result<Forecast, DecodeError> {
    if snapshot.payload_version != PAYLOAD_VERSION {
        return Err(DecodeError::VersionMismatch {
            found: snapshot.payload_version,
            expected: PAYLOAD_VERSION,
        });
    }
    Ok(serde_json::from_slice(&snapshot.payload)?)
}

async fn project(snapshot: Option<Snapshot>) -> Result<Projection, CacheError> {
    let Some(snapshot) = snapshot else {
        return Ok(Projection::Missing);
    };
    let projection = tokio::task::spawn_blocking(move || match decode(&snapshot) {
        Ok(forecast) => Projection::Ready(ForecastWithMeta {
            meta: ForecastMeta::from(&snapshot),
            forecast,
        }),
        Err(e) => {
            tracing::warn!("Snapshot {} could not be decoded: {}", snapshot.key(), e);
            Projection::Corrupt(e)
        }
    })
    .await?;
    Ok(projection)
}

#[derive(Clone)]
pub struct Projector {
    store: SnapshotStore,
}

impl Projector {
    pub fn new(store: SnapshotStore) -> Self {
        Self { store }
    }

    pub async fn load(&self, key: &SnapshotKey) -> Result<Projection, CacheError> {
        project(self.store.get(key).await?).await
    }

    /// `None` when there is no row or the row cannot be decoded.
    pub async fn get_once_with_meta(
        &self,
        key: &SnapshotKey,
    ) -> Result<Option<ForecastWithMeta>, CacheError> {
        Ok(self.load(key).await?.into_option())
    }

    pub fn observe_with_meta(&self, key: SnapshotKey) -> ForecastWatch {
        ForecastWatch { inner: self.store.observe(key) }
    }
}

/// Live sequence of decoded forecasts for one key.
///
/// A bad row or a failed read yields `Some(None)`; the sequence only ends when
/// the underlying store goes away.
pub struct ForecastWatch {
    inner: SnapshotWatch,
}

impl ForecastWatch {
    pub fn key(&self) -> &SnapshotKey {
        self.inner.key()
    }

    pub async fn next(&mut self) -> Option<Option<ForecastWithMeta>> {
        let snapshot = match self.inner.next().await? {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("Reading snapshot {} failed: {}", self.inner.key(), e);
                return Some(None);
            }
        };
        match project(snapshot).await {
            Ok(projection) => Some(projection.into_option()),
            Err(e) => {
                tracing::warn!("Projecting snapshot {} failed: {}", self.inner.key(), e);
                Some(None)
            }
        }
    }
}
