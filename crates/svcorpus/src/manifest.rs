//! The manifest (`filenames.txt`) is the single source of truth for what the corpus
//! holds. It is truncated at the start of every capture run, appended one record per
//! line with a flush after each write, and closed exactly once.
//!
//! The tile files on disk must match it entry for entry. [`purge_tiles`] clears the
//! previous run's tiles before sampling and [`reconcile`] removes tiles the manifest
//! never recorded (cancelled points, crashes).

use crate::geo::SamplePoint;
use crate::tile::TileKey;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest i/o on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corpus scan of '{path}' failed: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

impl ManifestError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// What one manifest line records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestMode {
    /// One accepted tile filename per line.
    #[default]
    Tiles,
    /// One `lat,lng` per point that produced at least one tile.
    Points,
}

impl std::str::FromStr for ManifestMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tiles" => Ok(ManifestMode::Tiles),
            "points" => Ok(ManifestMode::Points),
            other => Err(format!("unknown manifest mode '{other}', expected tiles|points")),
        }
    }
}

/// Exclusive writer for the duration of one capture run.
pub struct ManifestWriter {
    path: PathBuf,
    mode: ManifestMode,
    out: BufWriter<File>,
    entries: usize,
    tiles: Vec<String>,
}

impl ManifestWriter {
    /// Opens `path` in truncate mode, creating parent directories.
    pub fn create(path: &Path, mode: ManifestMode) -> Result<Self, ManifestError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| ManifestError::io(parent, e))?;
        }
        let file = File::create(path).map_err(|e| ManifestError::io(path, e))?;
        tracing::debug!(path = %path.display(), ?mode, "Manifest truncated");
        Ok(Self {
            path: path.to_path_buf(),
            mode,
            out: BufWriter::new(file),
            entries: 0,
            tiles: Vec::new(),
        })
    }

    pub fn mode(&self) -> ManifestMode {
        self.mode
    }

    /// Number of lines written so far.
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Records one accepted tile. In tile mode this writes a line.
    pub fn append_tile(&mut self, filename: &str) -> Result<(), ManifestError> {
        self.tiles.push(filename.to_owned());
        if self.mode == ManifestMode::Tiles {
            self.write_line(filename)?;
        }
        Ok(())
    }

    /// Records a point whose sweep produced tiles. In point mode this writes a line.
    pub fn append_point(&mut self, point: &SamplePoint) -> Result<(), ManifestError> {
        if self.mode == ManifestMode::Points {
            self.write_line(&point.to_string())?;
        }
        Ok(())
    }

    /// Appends everything a finished point contributed, in sweep order.
    pub fn record(&mut self, point: &SamplePoint, tiles: &[String]) -> Result<(), ManifestError> {
        for name in tiles {
            self.append_tile(name)?;
        }
        if !tiles.is_empty() {
            self.append_point(point)?;
        }
        Ok(())
    }

    fn write_line(&mut self, line: &str) -> Result<(), ManifestError> {
        writeln!(self.out, "{line}")
            .and_then(|_| self.out.flush())
            .map_err(|e| ManifestError::io(&self.path, e))?;
        self.entries += 1;
        Ok(())
    }

    /// Flushes, syncs and releases the file. Consuming `self` makes a second close
    /// (or a write after close) impossible.
    pub fn close(self) -> Result<ClosedManifest, ManifestError> {
        let path = self.path;
        let file = self
            .out
            .into_inner()
            .map_err(|e| ManifestError::io(&path, e.into_error()))?;
        file.sync_all().map_err(|e| ManifestError::io(&path, e))?;
        tracing::info!(path = %path.display(), entries = self.entries, "Manifest closed");
        Ok(ClosedManifest {
            path,
            mode: self.mode,
            entries: self.entries,
            tiles: self.tiles,
        })
    }
}

/// A manifest no writer holds any more; the only input an index rebuild accepts.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedManifest {
    pub path: PathBuf,
    pub mode: ManifestMode,
    pub entries: usize,
    /// Tile filenames accepted during the run, whatever the mode.
    pub tiles: Vec<String>,
}

impl ClosedManifest {
    /// Loads a manifest left by an earlier run. In point mode the tile set is
    /// recovered from the tile files present for each listed point.
    pub fn load(
        path: &Path,
        mode: ManifestMode,
        corpus_dir: &Path,
        extension: &str,
    ) -> Result<Self, ManifestError> {
        let lines = read_manifest(path)?;
        let tiles = match mode {
            ManifestMode::Tiles => lines.clone(),
            ManifestMode::Points => {
                let points: Vec<SamplePoint> = lines
                    .iter()
                    .filter_map(|l| {
                        let (lat, lng) = l.split_once(',')?;
                        Some(SamplePoint::new(lat.parse().ok()?, lng.parse().ok()?))
                    })
                    .collect();
                scan_tiles(corpus_dir, extension)?
                    .into_iter()
                    .filter(|(_, key)| points.contains(&key.point))
                    .map(|(name, _)| name)
                    .collect()
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            mode,
            entries: lines.len(),
            tiles,
        })
    }
}

/// Reads the non-empty lines of a manifest.
pub fn read_manifest(path: &Path) -> Result<Vec<String>, ManifestError> {
    let file = File::open(path).map_err(|e| ManifestError::io(path, e))?;
    let mut lines = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| ManifestError::io(path, e))?;
        let line = line.trim();
        if !line.is_empty() {
            lines.push(line.to_owned());
        }
    }
    Ok(lines)
}

/// Tile files directly inside `corpus_dir`, with their parsed keys.
pub fn scan_tiles(corpus_dir: &Path, extension: &str) -> Result<Vec<(String, TileKey)>, ManifestError> {
    if !corpus_dir.exists() {
        return Ok(Vec::new());
    }
    let mut tiles = Vec::new();
    for entry in WalkDir::new(corpus_dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| ManifestError::Scan {
            path: corpus_dir.to_path_buf(),
            source: e,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(key) = TileKey::parse(&name, extension) {
            tiles.push((name, key));
        }
    }
    tiles.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(tiles)
}

/// Deletes every tile file in `corpus_dir`. Returns how many were removed.
pub fn purge_tiles(corpus_dir: &Path, extension: &str) -> Result<usize, ManifestError> {
    remove_tiles_where(corpus_dir, extension, |_| true)
}

/// Deletes tile files that are not in `accepted`. Returns how many were removed.
pub fn reconcile(corpus_dir: &Path, extension: &str, accepted: &[String]) -> Result<usize, ManifestError> {
    let keep: HashSet<&str> = accepted.iter().map(String::as_str).collect();
    let removed = remove_tiles_where(corpus_dir, extension, |name| !keep.contains(name))?;
    if removed > 0 {
        tracing::warn!(
            corpus_dir = %corpus_dir.display(),
            removed,
            "Removed tile files missing from the manifest"
        );
    }
    Ok(removed)
}

fn remove_tiles_where<F>(corpus_dir: &Path, extension: &str, mut doomed: F) -> Result<usize, ManifestError>
where
    F: FnMut(&str) -> bool,
{
    let mut removed = 0;
    for (name, _) in scan_tiles(corpus_dir, extension)? {
        if doomed(&name) {
            let path = corpus_dir.join(&name);
            fs::remove_file(&path).map_err(|e| ManifestError::io(&path, e))?;
            removed += 1;
        }
    }
    Ok(removed)
}
