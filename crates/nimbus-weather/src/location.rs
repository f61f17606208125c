//! Device location source.

use std::future::Future;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lon)
    }
}

/// Something that can report the current position, if it knows it.
pub trait LocationProvider: Send + Sync + 'static {
    fn current_fix(&self) -> impl Future<Output = Option<GeoPoint>> + Send;
}

/// A provider that always answers with the same point (or nothing).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FixedLocation(Option<GeoPoint>);

impl FixedLocation {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self(Some(GeoPoint::new(lat, lon)))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

impl LocationProvider for FixedLocation {
    async fn current_fix(&self) -> Option<GeoPoint> {
        self.0.filter(GeoPoint::is_valid)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[tokio::test]
    async fn test_fixed_location() {
        assert_eq!(FixedLocation::new(1.0, 2.0).current_fix().await, Some(GeoPoint::new(1.0, 2.0)));
        assert_eq!(FixedLocation::none().current_fix().await, None);
    }

    #[tokio::test]
    async fn test_out_of_range_fix_is_ignored() {
        assert_eq!(FixedLocation::new(91.0, 0.0).current_fix().await, None);
    }
}
