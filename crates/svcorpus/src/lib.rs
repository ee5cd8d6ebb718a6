//! svcorpus: geo-referenced street-imagery corpus and photo locate orchestration.
//!
//! - Samples a bounding box (or an explicit point list) and fetches panoramic tiles per
//!   point across a heading/pitch sweep.
//! - Rejects "no imagery" tiles by the provider's sentinel colour at pixel (0,0).
//! - Keeps the manifest (`filenames.txt`) in step with the tile files on disk.
//! - Drives an external feature engine: per-point feature computation, one index rebuild
//!   per capture run, and locate queries.
//! - Bounds query photos to a fixed pixel budget before they reach the engine.
//!
//! Corpus layout:
//!   <corpus_dir>/<lat>,<lng>,<heading>,<pitch>.jpg   one file per accepted tile
//!   <corpus_dir>/filenames.txt                         manifest, one record per line
//!   <features_dir>/...                                 owned by the feature engine

pub mod capture;
pub mod config;
pub mod corpus;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod geo;
pub mod grid;
pub mod locate;
pub mod manifest;
pub mod metrics;
pub mod places;
pub mod preprocess;
pub mod sentinel;
pub mod tile;
pub mod triangulate;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use capture::{CaptureContext, CaptureRequest, CaptureRun, PointCapture, RunPhase, RunStatus};
pub use config::CorpusConfig;
pub use corpus::Corpus;
pub use engine::{CorpusPaths, FeatureEngine};
pub use error::{CaptureError, LocateError};
pub use fetch::{ImageryProvider, StreetViewProvider};
pub use geo::{BoundingBox, LatLng, SamplePoint};
pub use grid::SampleSource;
pub use locate::{LocationResult, StoredQuery};
pub use manifest::{ClosedManifest, ManifestMode, ManifestWriter};
pub use metrics::Metrics;
pub use places::{NewPlace, Place, PlaceStore, PlacesLookup};
pub use tile::{TileKey, TileList};
