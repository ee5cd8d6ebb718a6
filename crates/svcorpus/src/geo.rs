use serde::{Deserialize, Serialize};
use std::fmt;

/// Mean Earth radius used for great-circle distances, in metres.
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Metres per degree of latitude (and of longitude at the equator).
pub const METRES_PER_DEGREE: f64 = 111_320.0;

/// A WGS-84 coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

/// A grid or list point the capture run fetches imagery for.
pub type SamplePoint = LatLng;

impl LatLng {
    #[inline]
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    #[inline]
    pub fn is_finite(&self) -> bool {
        self.lat.is_finite() && self.lng.is_finite()
    }

    /// Great-circle distance in metres (haversine).
    pub fn distance_m(&self, other: &LatLng) -> f64 {
        let (phi1, phi2) = (self.lat.to_radians(), other.lat.to_radians());
        let d_phi = (other.lat - self.lat).to_radians();
        let d_lambda = (other.lng - self.lng).to_radians();
        let a = (d_phi / 2.0).sin().powi(2)
            + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
    }
}

/// Renders as `lat,lng`, the form used by the provider's `location` parameter
/// and by point-mode manifest lines.
impl fmt::Display for LatLng {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.lat, self.lng)
    }
}

/// Sampling area given by two opposite corners. Corner order is not normalised:
/// the grid interpolates from `(lat2, lng2)` towards `(lat1, lng1)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub lat1: f64,
    pub lng1: f64,
    pub lat2: f64,
    pub lng2: f64,
}

impl BoundingBox {
    pub fn new(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> Self {
        Self { lat1, lng1, lat2, lng2 }
    }

    pub fn is_finite(&self) -> bool {
        [self.lat1, self.lng1, self.lat2, self.lng2]
            .iter()
            .all(|v| v.is_finite())
    }
}
