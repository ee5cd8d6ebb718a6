//! Locate orchestration: bound the query photo, ask the engine, assemble the answer.

use crate::engine::{CorpusPaths, FeatureEngine};
use crate::error::LocateError;
use crate::geo::LatLng;
use crate::places::{Place, PlacesLookup};
use crate::preprocess::preprocess_query_async;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Extensions accepted for uploaded query photos.
pub const QUERY_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// `{"success": false}` on failure; coordinates and places are omitted, not null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub places: Option<Vec<Place>>,
}

impl LocationResult {
    pub fn failure() -> Self {
        Self {
            success: false,
            lat: None,
            lng: None,
            places: None,
        }
    }

    pub fn found(at: LatLng) -> Self {
        Self {
            success: true,
            lat: Some(at.lat),
            lng: Some(at.lng),
            places: None,
        }
    }

    pub fn coordinate(&self) -> Option<LatLng> {
        match (self.success, self.lat, self.lng) {
            (true, Some(lat), Some(lng)) => Some(LatLng::new(lat, lng)),
            _ => None,
        }
    }

    pub fn with_places(mut self, places: Vec<Place>) -> Self {
        self.places = Some(places);
        self
    }
}

/// Preprocesses `query` in place, then asks the engine where it was taken.
pub async fn locate(
    engine: &dyn FeatureEngine,
    paths: &CorpusPaths,
    query: &Path,
    budget: u32,
) -> Result<LocationResult, LocateError> {
    preprocess_query_async(query.to_path_buf(), budget).await?;
    let result = match engine.locate(paths, query).await? {
        Some(at) => {
            tracing::info!(lat = at.lat, lng = at.lng, "Query located");
            LocationResult::found(at)
        }
        None => {
            tracing::info!(query = %query.display(), "Query did not match the corpus");
            LocationResult::failure()
        }
    };
    Ok(result)
}

/// [`locate`], plus places within `radius_m` of a successful answer.
pub async fn locate_with_places(
    engine: &dyn FeatureEngine,
    places: &dyn PlacesLookup,
    paths: &CorpusPaths,
    query: &Path,
    budget: u32,
    radius_m: f64,
) -> Result<LocationResult, LocateError> {
    let result = locate(engine, paths, query, budget).await?;
    match result.coordinate() {
        Some(at) => {
            let nearby = places.nearby(at, radius_m).await?;
            Ok(result.with_places(nearby))
        }
        None => Ok(result),
    }
}

/// Per-tile match counts for a query, as CSV.
pub async fn match_report(
    engine: &dyn FeatureEngine,
    paths: &CorpusPaths,
    query: &Path,
    budget: u32,
) -> Result<String, LocateError> {
    preprocess_query_async(query.to_path_buf(), budget).await?;
    let table = engine.match_counts(paths, query).await?;
    tracing::debug!(rows = table.rows().len(), "Match table produced");
    Ok(table.to_csv())
}

/// Lower-cased extension of an upload name, if it is an accepted image type.
pub fn query_extension(filename: &str) -> Result<String, LocateError> {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .filter(|e| QUERY_EXTENSIONS.contains(&e.as_str()));
    ext.ok_or_else(|| LocateError::UnsupportedUpload(filename.to_owned()))
}

/// An uploaded query photo on disk. Removed when dropped.
#[derive(Debug)]
pub struct StoredQuery {
    path: PathBuf,
}

impl StoredQuery {
    /// Writes `bytes` under a unique name in `upload_dir`, keeping the upload's extension.
    pub async fn store(upload_dir: &Path, filename: &str, bytes: &[u8]) -> Result<Self, LocateError> {
        let ext = query_extension(filename)?;
        let io = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| LocateError::Io { path, source }
        };
        tokio::fs::create_dir_all(upload_dir)
            .await
            .map_err(io(upload_dir))?;
        let path = upload_dir.join(format!("query-{}.{ext}", Uuid::new_v4()));
        tokio::fs::write(&path, bytes).await.map_err(io(&path))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoredQuery {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!(path = %self.path.display(), error = %e, "Query file already gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::places::{NewPlace, PlaceStore};
    use crate::testing::{solid_png, EngineEvent, RecordingEngine};
    use crate::tile::TileKey;
    use crate::triangulate::{MatchTable, TileMatch};

    fn paths(dir: &Path) -> CorpusPaths {
        CorpusPaths {
            corpus_dir: dir.join("sv"),
            features_dir: dir.join("sv/features"),
            manifest: dir.join("sv/filenames.txt"),
        }
    }

    fn crossing_table() -> MatchTable {
        let row = |lat, lng, heading, matches| TileMatch {
            key: TileKey::new(LatLng::new(lat, lng), heading, 10),
            matches,
        };
        MatchTable::new(vec![row(0.0, 0.0, 45, 40), row(0.0, 2.0, 315, 30)])
    }

    async fn stored(dir: &Path, width: u32, height: u32) -> StoredQuery {
        StoredQuery::store(&dir.join("uploads"), "photo.PNG", &solid_png([9, 9, 9], width, height))
            .await
            .unwrap()
    }

    #[test]
    fn failure_serialises_without_coordinates() {
        let json = serde_json::to_string(&LocationResult::failure()).unwrap();
        assert_eq!(json, r#"{"success":false}"#);
        let json = serde_json::to_value(LocationResult::found(LatLng::new(1.5, -2.0))).unwrap();
        assert_eq!(json, serde_json::json!({"success": true, "lat": 1.5, "lng": -2.0}));
    }

    #[tokio::test]
    async fn query_is_bounded_before_the_engine_sees_it() {
        let dir = tempfile::tempdir().unwrap();
        let engine = RecordingEngine::new().with_matches(crossing_table());
        let query = stored(dir.path(), 1600, 1200).await;

        let result = locate(&engine, &paths(dir.path()), query.path(), 800).await.unwrap();
        assert!(result.success);
        let at = result.coordinate().unwrap();
        assert!((at.lat - 1.0).abs() < 1e-9 && (at.lng - 1.0).abs() < 1e-9);

        match &engine.events()[..] {
            [EngineEvent::Match { dimensions, .. }] => assert_eq!(*dimensions, Some((800, 600))),
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[tokio::test]
    async fn unmatched_query_is_a_plain_failure() {
        let dir = tempfile::tempdir().unwrap();
        let engine = RecordingEngine::new();
        let store = PlaceStore::new();
        let query = stored(dir.path(), 100, 100).await;

        let result = locate_with_places(&engine, &store, &paths(dir.path()), query.path(), 500, 100.0)
            .await
            .unwrap();
        assert_eq!(result, LocationResult::failure());
    }

    #[tokio::test]
    async fn places_are_attached_to_a_located_query() {
        let dir = tempfile::tempdir().unwrap();
        let engine = RecordingEngine::new().with_matches(crossing_table());
        let store = PlaceStore::new();
        store
            .insert(NewPlace {
                name: "fountain".into(),
                lat: 1.0002,
                lng: 1.0,
                description: None,
            })
            .unwrap();
        store
            .insert(NewPlace {
                name: "elsewhere".into(),
                lat: 3.0,
                lng: 3.0,
                description: None,
            })
            .unwrap();
        let query = stored(dir.path(), 640, 480).await;

        let result = locate_with_places(&engine, &store, &paths(dir.path()), query.path(), 800, 100.0)
            .await
            .unwrap();
        let names: Vec<_> = result.places.unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["fountain"]);
    }

    #[tokio::test]
    async fn engine_failure_is_an_error_not_a_coordinate() {
        let dir = tempfile::tempdir().unwrap();
        let engine = RecordingEngine::new().failing_match();
        let query = stored(dir.path(), 64, 64).await;
        let err = locate(&engine, &paths(dir.path()), query.path(), 800).await.unwrap_err();
        assert!(matches!(err, LocateError::Engine(_)));
    }

    #[tokio::test]
    async fn match_report_is_csv() {
        let dir = tempfile::tempdir().unwrap();
        let engine = RecordingEngine::new().with_matches(crossing_table());
        let query = stored(dir.path(), 64, 64).await;
        let csv = match_report(&engine, &paths(dir.path()), query.path(), 800).await.unwrap();
        assert_eq!(csv, "LAT,LNG,HEADING,PITCH,#MATCHES\n0,0,45,10,40\n0,2,315,10,30\n");
    }

    #[tokio::test]
    async fn stored_query_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let query = stored(dir.path(), 8, 8).await;
        let path = query.path().to_path_buf();
        assert!(path.exists());
        assert_eq!(path.extension().unwrap(), "png");
        drop(query);
        assert!(!path.exists());
    }

    #[test]
    fn only_image_uploads_are_accepted() {
        assert_eq!(query_extension("IMG_0001.JPG").unwrap(), "jpg");
        assert_eq!(query_extension("a.jpeg").unwrap(), "jpeg");
        assert!(matches!(
            query_extension("notes.txt"),
            Err(LocateError::UnsupportedUpload(_))
        ));
        assert!(query_extension("noext").is_err());
    }
}
