use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use svcorpus::fetch::{FetchConfig, REDACTED};
use svcorpus::manifest::ManifestMode;
use svcorpus::sentinel::SentinelPolicy;
use svcorpus::{BoundingBox, CorpusConfig};

/// `svcapture` - builds and maintains a street-imagery corpus without the HTTP server.
///
/// Shares its on-disk layout and environment with `svlocate_server`, so a corpus
/// captured here can be queried there.
#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Root under which `sv/`, `sv/features/` and `uploads/` live.
    #[arg(long, env = "SVLOCATE_DATA_DIR", default_value = ".")]
    pub data_dir: PathBuf,

    /// The native feature toolkit invoked for features, indexing and matching.
    #[arg(long, env = "SVLOCATE_ENGINE_BINARY")]
    pub engine_binary: PathBuf,

    /// Street-view API key. Only needed by `capture`.
    #[arg(long, env = "SVLOCATE_STREETVIEW_KEY", hide_env_values = true)]
    pub streetview_key: Option<String>,

    #[arg(long, env = "SVLOCATE_STREETVIEW_URL")]
    pub streetview_url: Option<String>,

    /// `abort_point` stops a point's sweep at its first "no imagery" tile;
    /// `skip_tile` drops only that tile.
    #[arg(long, env = "SVLOCATE_SENTINEL_POLICY", default_value = "abort_point")]
    pub sentinel_policy: SentinelPolicy,

    /// `tiles` writes one manifest line per tile, `points` one per covered point.
    #[arg(long, env = "SVLOCATE_MANIFEST_MODE", default_value = "tiles")]
    pub manifest_mode: ManifestMode,

    #[arg(long, env = "SVLOCATE_FETCH_TIMEOUT_MS", default_value_t = 15_000)]
    pub fetch_timeout_ms: u64,

    /// Stop sampling after this many seconds; the manifest is kept but not indexed.
    #[arg(long, env = "SVLOCATE_RUN_DEADLINE_SECS")]
    pub run_deadline_secs: Option<u64>,

    #[arg(long, env = "SVLOCATE_MAX_CONCURRENT_FETCHES", default_value_t = 8)]
    pub max_concurrent_fetches: usize,

    #[arg(long, env = "SVLOCATE_POINT_CONCURRENCY", default_value_t = 4)]
    pub point_concurrency: usize,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Sample an area (or a point list), fetch tiles, and rebuild the index.
    Capture {
        /// Heading step and field of view, in degrees (1-359).
        #[arg(long)]
        theta: u32,

        /// Bounding box as `lat1,lng1,lat2,lng2`.
        #[arg(long, value_parser = parse_bbox, allow_hyphen_values = true, required_unless_present = "points")]
        bbox: Option<BoundingBox>,

        /// Mesh density; the box yields `(density+1)^2` points.
        #[arg(long, requires = "bbox", default_value_t = 1)]
        density: u32,

        /// File of colon-delimited `lat,lng` pairs, used instead of a bounding box.
        #[arg(long, conflicts_with = "bbox")]
        points: Option<PathBuf>,
    },
    /// Rebuild the feature index over the manifest already on disk.
    Index,
    /// Delete tile files the manifest on disk does not list.
    Reconcile,
}

fn parse_bbox(s: &str) -> Result<BoundingBox, String> {
    let coords: Vec<f64> = s
        .split(',')
        .map(|c| c.trim().parse::<f64>().map_err(|e| format!("'{c}': {e}")))
        .collect::<Result<_, _>>()?;
    match coords[..] {
        [lat1, lng1, lat2, lng2] => Ok(BoundingBox::new(lat1, lng1, lat2, lng2)),
        _ => Err(format!("expected 4 comma-separated numbers, got {}", coords.len())),
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("data_dir", &self.data_dir)
            .field("engine_binary", &self.engine_binary)
            .field("streetview_key", &self.streetview_key.as_ref().map(|_| REDACTED))
            .field("streetview_url", &self.streetview_url)
            .field("sentinel_policy", &self.sentinel_policy)
            .field("manifest_mode", &self.manifest_mode)
            .field("fetch_timeout_ms", &self.fetch_timeout_ms)
            .field("run_deadline_secs", &self.run_deadline_secs)
            .field("max_concurrent_fetches", &self.max_concurrent_fetches)
            .field("point_concurrency", &self.point_concurrency)
            .field("command", &self.command)
            .finish()
    }
}

impl Config {
    pub fn corpus_config(&self) -> CorpusConfig {
        CorpusConfig {
            sentinel_policy: self.sentinel_policy,
            manifest_mode: self.manifest_mode,
            fetch_timeout: Duration::from_millis(self.fetch_timeout_ms),
            run_deadline: self.run_deadline_secs.map(Duration::from_secs),
            max_concurrent_fetches: self.max_concurrent_fetches,
            point_concurrency: self.point_concurrency,
            ..CorpusConfig::with_root(&self.data_dir)
        }
    }

    pub fn fetch_config(&self) -> FetchConfig {
        let defaults = FetchConfig::default();
        FetchConfig {
            base_url: self.streetview_url.clone().unwrap_or(defaults.base_url.clone()),
            api_key: self.streetview_key.clone().unwrap_or_default(),
            timeout: Duration::from_millis(self.fetch_timeout_ms),
            ..defaults
        }
    }
}
