use super::{CorpusPaths, EngineError, FeatureEngine};
use crate::manifest::ClosedManifest;
use crate::tile::TileList;
use crate::triangulate::MatchTable;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Runs the native toolkit as a child process, one invocation per operation:
///
/// ```text
/// <bin> features --corpus DIR --features DIR --tiles a.jpg:b.jpg
/// <bin> index    --corpus DIR --features DIR --manifest FILE
/// <bin> match    --corpus DIR --features DIR --manifest FILE --query FILE
/// ```
///
/// `match` prints a `LAT,LNG,HEADING,PITCH,#MATCHES` table on stdout.
#[derive(Debug, Clone)]
pub struct ExternalEngine {
    binary: PathBuf,
    leading_args: Vec<OsString>,
}

impl ExternalEngine {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            leading_args: Vec::new(),
        }
    }

    /// Arguments placed before the subcommand, e.g. a script for an interpreter binary.
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    fn base_args(subcommand: &str, paths: &CorpusPaths) -> Vec<OsString> {
        vec![
            subcommand.into(),
            "--corpus".into(),
            paths.corpus_dir.clone().into(),
            "--features".into(),
            paths.features_dir.clone().into(),
        ]
    }

    async fn run(&self, args: Vec<OsString>) -> Result<String, EngineError> {
        let command = format!(
            "{} {}",
            self.binary.display(),
            args.first().map(|a| a.to_string_lossy()).unwrap_or_default()
        );
        tracing::debug!(command, "Invoking feature engine");

        let output = Command::new(&self.binary)
            .args(&self.leading_args)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| EngineError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(EngineError::Failed {
                command,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl FeatureEngine for ExternalEngine {
    async fn compute_features(&self, paths: &CorpusPaths, tiles: &TileList) -> Result<(), EngineError> {
        let mut args = Self::base_args("features", paths);
        args.extend(["--tiles".into(), tiles.to_string().into()]);
        self.run(args).await.map(|_| ())
    }

    async fn rebuild_index(&self, paths: &CorpusPaths, manifest: &ClosedManifest) -> Result<(), EngineError> {
        let mut args = Self::base_args("index", paths);
        args.extend(["--manifest".into(), manifest.path.clone().into()]);
        self.run(args).await.map(|_| ())
    }

    async fn match_counts(&self, paths: &CorpusPaths, query: &Path) -> Result<MatchTable, EngineError> {
        let mut args = Self::base_args("match", paths);
        args.extend([
            "--manifest".into(),
            paths.manifest.clone().into(),
            "--query".into(),
            query.as_os_str().to_owned(),
        ]);
        let stdout = self.run(args).await?;
        Ok(MatchTable::parse_csv(&stdout)?)
    }
}
