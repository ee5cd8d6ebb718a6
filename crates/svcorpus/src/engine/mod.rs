//! Boundary to the native feature toolkit: keypoint/descriptor extraction, the
//! corpus-wide nearest-neighbour index, and query matching. The core only hands it
//! filenames and paths, in an order that keeps the index in step with the manifest.

mod external;

pub use external::ExternalEngine;

use crate::geo::LatLng;
use crate::manifest::ClosedManifest;
use crate::tile::TileList;
use crate::triangulate::{MatchTable, MatchTableError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to launch engine command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("engine command '{command}' exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("engine produced unreadable match output: {0}")]
    Output(#[from] MatchTableError),
    #[error("feature engine unavailable: {0}")]
    Unavailable(String),
}

/// Filesystem locations shared by the core and the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusPaths {
    pub corpus_dir: PathBuf,
    pub features_dir: PathBuf,
    pub manifest: PathBuf,
}

#[async_trait]
pub trait FeatureEngine: Send + Sync {
    /// Computes and stores features for tiles of one point, right after its sweep.
    async fn compute_features(&self, paths: &CorpusPaths, tiles: &TileList) -> Result<(), EngineError>;

    /// Rebuilds the searchable index over a closed manifest. Runs once per capture run.
    async fn rebuild_index(&self, paths: &CorpusPaths, manifest: &ClosedManifest) -> Result<(), EngineError>;

    /// Per-tile match counts for a preprocessed query photo.
    async fn match_counts(&self, paths: &CorpusPaths, query: &Path) -> Result<MatchTable, EngineError>;

    /// Best-match coordinate for a preprocessed query photo, `None` when unmatched.
    async fn locate(&self, paths: &CorpusPaths, query: &Path) -> Result<Option<LatLng>, EngineError> {
        Ok(self.match_counts(paths, query).await?.locate())
    }
}
