use crate::engine::CorpusPaths;
use crate::manifest::ManifestMode;
use crate::places::DEFAULT_RADIUS_M;
use crate::preprocess::STANDARD_BUDGET;
use crate::sentinel::{SentinelPolicy, NO_IMAGERY_RGB};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("pitch set must not be empty")]
    NoPitches,
    #[error("pitch set must be strictly ascending")]
    UnorderedPitches,
    #[error("{0} must be at least 1")]
    ZeroLimit(&'static str),
    #[error("tile extension must not be empty")]
    NoExtension,
}

/// Everything the capture and locate paths need, passed in at construction.
#[derive(Debug, Clone)]
pub struct CorpusConfig {
    pub corpus_dir: PathBuf,
    pub features_dir: PathBuf,
    pub manifest_filename: String,
    /// Where uploaded query photos are stored while a request is served.
    pub upload_dir: PathBuf,
    pub tile_extension: String,
    /// Ascending pitch values swept under every heading.
    pub pitches: Vec<i32>,
    pub sentinel_rgb: [u8; 3],
    pub sentinel_tolerance: u8,
    pub sentinel_policy: SentinelPolicy,
    pub manifest_mode: ManifestMode,
    /// Larger side of a preprocessed query photo, in pixels.
    pub query_budget: u32,
    pub places_radius_m: f64,
    pub fetch_timeout: Duration,
    /// Overall deadline for the sampling phase of one run.
    pub run_deadline: Option<Duration>,
    /// Provider requests in flight across the whole run.
    pub max_concurrent_fetches: usize,
    /// Sample points swept concurrently.
    pub point_concurrency: usize,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self::with_root(Path::new("."))
    }
}

impl CorpusConfig {
    /// Default layout under `root`: `sv/`, `sv/features/`, `uploads/`.
    pub fn with_root(root: &Path) -> Self {
        Self {
            corpus_dir: root.join("sv"),
            features_dir: root.join("sv").join("features"),
            manifest_filename: "filenames.txt".into(),
            upload_dir: root.join("uploads"),
            tile_extension: "jpg".into(),
            pitches: vec![10, 20, 30, 40],
            sentinel_rgb: NO_IMAGERY_RGB,
            sentinel_tolerance: 0,
            sentinel_policy: SentinelPolicy::AbortPoint,
            manifest_mode: ManifestMode::Tiles,
            query_budget: STANDARD_BUDGET,
            places_radius_m: DEFAULT_RADIUS_M,
            fetch_timeout: Duration::from_secs(15),
            run_deadline: None,
            max_concurrent_fetches: 8,
            point_concurrency: 4,
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.corpus_dir.join(&self.manifest_filename)
    }

    pub fn paths(&self) -> CorpusPaths {
        CorpusPaths {
            corpus_dir: self.corpus_dir.clone(),
            features_dir: self.features_dir.clone(),
            manifest: self.manifest_path(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pitches.is_empty() {
            return Err(ConfigError::NoPitches);
        }
        if self.pitches.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::UnorderedPitches);
        }
        if self.max_concurrent_fetches == 0 {
            return Err(ConfigError::ZeroLimit("max_concurrent_fetches"));
        }
        if self.point_concurrency == 0 {
            return Err(ConfigError::ZeroLimit("point_concurrency"));
        }
        if self.query_budget == 0 {
            return Err(ConfigError::ZeroLimit("query_budget"));
        }
        if self.tile_extension.is_empty() {
            return Err(ConfigError::NoExtension);
        }
        Ok(())
    }
}
