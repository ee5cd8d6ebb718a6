//! In-process stand-ins for the imagery provider and the feature engine.

use crate::engine::{CorpusPaths, EngineError, FeatureEngine};
use crate::fetch::{FetchError, ImageryProvider, TileRequest};
use crate::manifest::{read_manifest, ClosedManifest};
use crate::sentinel::NO_IMAGERY_RGB;
use crate::tile::TileList;
use crate::triangulate::MatchTable;
use async_trait::async_trait;
use bytes::Bytes;
use image::{ImageFormat, Rgb, RgbImage};
use parking_lot::Mutex;
use std::io::Cursor;
use std::path::{Path, PathBuf};

/// Colour of a tile that carries real imagery.
pub const IMAGERY_RGB: [u8; 3] = [40, 90, 160];

/// Solid-colour PNG. PNG keeps the sentinel colour exact, unlike JPEG.
pub fn solid_png(rgb: [u8; 3], width: u32, height: u32) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    RgbImage::from_pixel(width, height, Rgb(rgb))
        .write_to(&mut out, ImageFormat::Png)
        .expect("png encode");
    out.into_inner()
}

/// What the scripted provider answers for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Imagery,
    NoImagery,
    /// HTTP 500 from the provider.
    Fail,
    /// Bytes that do not decode as an image.
    Corrupt,
    /// Never answers.
    Hang,
}

type Script = Box<dyn Fn(&TileRequest) -> Reply + Send + Sync>;

pub struct ScriptedProvider {
    script: Script,
    calls: Mutex<Vec<TileRequest>>,
}

impl ScriptedProvider {
    pub fn new(script: impl Fn(&TileRequest) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn always_imagery() -> Self {
        Self::new(|_| Reply::Imagery)
    }

    /// Every request received so far, in arrival order.
    pub fn calls(&self) -> Vec<TileRequest> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ImageryProvider for ScriptedProvider {
    async fn fetch(&self, request: &TileRequest) -> Result<Bytes, FetchError> {
        self.calls.lock().push(*request);
        match (self.script)(request) {
            Reply::Imagery => Ok(Bytes::from(solid_png(IMAGERY_RGB, 16, 16))),
            Reply::NoImagery => Ok(Bytes::from(solid_png(NO_IMAGERY_RGB, 16, 16))),
            Reply::Fail => Err(FetchError::Status(500)),
            Reply::Corrupt => Ok(Bytes::from_static(b"<html>quota exceeded</html>")),
            Reply::Hang => std::future::pending().await,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Features(Vec<String>),
    /// Manifest lines on disk when the rebuild started.
    Rebuild { lines_on_disk: usize, tiles: Vec<String> },
    Match { query: PathBuf, dimensions: Option<(u32, u32)> },
}

/// Records every call in order and answers match requests from a fixed table.
#[derive(Default)]
pub struct RecordingEngine {
    events: Mutex<Vec<EngineEvent>>,
    table: MatchTable,
    fail_features: bool,
    fail_match: bool,
    fail_rebuild: bool,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_matches(mut self, table: MatchTable) -> Self {
        self.table = table;
        self
    }

    pub fn failing_features(mut self) -> Self {
        self.fail_features = true;
        self
    }

    pub fn failing_rebuild(mut self) -> Self {
        self.fail_rebuild = true;
        self
    }

    pub fn failing_match(mut self) -> Self {
        self.fail_match = true;
        self
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    pub fn rebuilds(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, EngineEvent::Rebuild { .. }))
            .count()
    }
}

#[async_trait]
impl FeatureEngine for RecordingEngine {
    async fn compute_features(&self, _paths: &CorpusPaths, tiles: &TileList) -> Result<(), EngineError> {
        self.events
            .lock()
            .push(EngineEvent::Features(tiles.names().to_vec()));
        if self.fail_features {
            return Err(EngineError::Unavailable("scripted feature failure".into()));
        }
        Ok(())
    }

    async fn rebuild_index(&self, _paths: &CorpusPaths, manifest: &ClosedManifest) -> Result<(), EngineError> {
        let lines_on_disk = read_manifest(&manifest.path).map(|l| l.len()).unwrap_or(0);
        self.events.lock().push(EngineEvent::Rebuild {
            lines_on_disk,
            tiles: manifest.tiles.clone(),
        });
        if self.fail_rebuild {
            return Err(EngineError::Unavailable("scripted rebuild failure".into()));
        }
        Ok(())
    }

    async fn match_counts(&self, _paths: &CorpusPaths, query: &Path) -> Result<MatchTable, EngineError> {
        self.events.lock().push(EngineEvent::Match {
            query: query.to_path_buf(),
            dimensions: image::image_dimensions(query).ok(),
        });
        if self.fail_match {
            return Err(EngineError::Unavailable("scripted match failure".into()));
        }
        Ok(self.table.clone())
    }
}
