use crate::capture::RunPhase;
use crate::config::ConfigError;
use crate::engine::EngineError;
use crate::grid::GridError;
use crate::manifest::ManifestError;
use crate::places::PlacesError;
use crate::preprocess::PreprocessError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("theta must be between 1 and 359 degrees, got {0}")]
    InvalidTheta(u32),
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("feature engine: {0}")]
    Engine(#[from] EngineError),
    #[error("tile i/o on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("run is in phase {actual:?}, expected {expected:?}")]
    InvalidPhase { expected: RunPhase, actual: RunPhase },
    #[error("capture run exceeded its deadline")]
    DeadlineExceeded,
    #[error("a capture run is already in progress")]
    Busy,
    #[error("corpus is serving locate queries, retry shortly")]
    QueriesInFlight,
    #[error("capture task failed: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum LocateError {
    #[error("corpus is being rebuilt by a capture run")]
    Busy,
    #[error("unsupported upload '{0}', expected .jpg, .jpeg or .png")]
    UnsupportedUpload(String),
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error("feature engine: {0}")]
    Engine(#[from] EngineError),
    #[error("places lookup: {0}")]
    Places(#[from] PlacesError),
    #[error("query i/o on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
