//! Points of interest near a located coordinate.

use crate::geo::{LatLng, METRES_PER_DEGREE};
use async_trait::async_trait;
use parking_lot::RwLock;
use rstar::primitives::GeomWithData;
use rstar::{RTree, AABB};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Search radius attached to located results, in metres.
pub const DEFAULT_RADIUS_M: f64 = 100.0;

#[derive(Debug, Error, PartialEq)]
pub enum PlacesError {
    #[error("place coordinates must be finite and within range")]
    InvalidCoordinate,
    #[error("place name must not be empty")]
    EmptyName,
    #[error("radius must be a positive number of metres")]
    InvalidRadius,
    #[error("places backend unavailable: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub id: Uuid,
    pub name: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewPlace {
    pub name: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub description: Option<String>,
}

#[async_trait]
pub trait PlacesLookup: Send + Sync {
    /// Places within `radius_m` of `at`, nearest first.
    async fn nearby(&self, at: LatLng, radius_m: f64) -> Result<Vec<Place>, PlacesError>;
}

/// `[lng, lat]` keyed entries so the tree's x axis is longitude.
type Entry = GeomWithData<[f64; 2], Place>;

/// In-memory place store backed by an R-tree.
#[derive(Default)]
pub struct PlaceStore {
    tree: RwLock<RTree<Entry>>,
}

impl PlaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, new: NewPlace) -> Result<Place, PlacesError> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(PlacesError::EmptyName);
        }
        let at = LatLng::new(new.lat, new.lng);
        if !valid(&at) {
            return Err(PlacesError::InvalidCoordinate);
        }
        let place = Place {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            lat: new.lat,
            lng: new.lng,
            description: new.description,
        };
        self.tree
            .write()
            .insert(GeomWithData::new([place.lng, place.lat], place.clone()));
        tracing::debug!(id = %place.id, name = place.name, "Place stored");
        Ok(place)
    }

    pub fn len(&self) -> usize {
        self.tree.read().size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All places, ordered by name.
    pub fn list(&self) -> Vec<Place> {
        let mut all: Vec<Place> = self.tree.read().iter().map(|e| e.data.clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        all
    }

    pub fn within(&self, at: LatLng, radius_m: f64) -> Result<Vec<Place>, PlacesError> {
        if !valid(&at) {
            return Err(PlacesError::InvalidCoordinate);
        }
        if !(radius_m.is_finite() && radius_m > 0.0) {
            return Err(PlacesError::InvalidRadius);
        }

        // Degree envelope that contains the metric circle, then an exact distance filter.
        let d_lat = radius_m / METRES_PER_DEGREE;
        let d_lng = radius_m / (METRES_PER_DEGREE * at.lat.to_radians().cos().max(1e-6));
        let envelope = AABB::from_corners([at.lng - d_lng, at.lat - d_lat], [at.lng + d_lng, at.lat + d_lat]);

        let tree = self.tree.read();
        let mut hits: Vec<(f64, Place)> = tree
            .locate_in_envelope(&envelope)
            .filter_map(|e| {
                let d = at.distance_m(&LatLng::new(e.data.lat, e.data.lng));
                (d <= radius_m).then(|| (d, e.data.clone()))
            })
            .collect();
        hits.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(hits.into_iter().map(|(_, p)| p).collect())
    }
}

fn valid(at: &LatLng) -> bool {
    at.is_finite() && (-90.0..=90.0).contains(&at.lat) && (-180.0..=180.0).contains(&at.lng)
}

#[async_trait]
impl PlacesLookup for PlaceStore {
    async fn nearby(&self, at: LatLng, radius_m: f64) -> Result<Vec<Place>, PlacesError> {
        self.within(at, radius_m)
    }
}
