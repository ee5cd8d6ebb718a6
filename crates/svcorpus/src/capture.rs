//! Capture runs: sample points, sweep headings and pitches per point, keep the
//! manifest in step with the tile files, and rebuild the feature index once.
//!
//! A run moves through `Idle → Sampling → ManifestClosed → Indexed`, or ends in
//! `Failed`. Points are swept concurrently but their results are appended to the
//! manifest in sample order, so identical requests produce identical manifests.

use crate::config::CorpusConfig;
use crate::engine::{CorpusPaths, FeatureEngine};
use crate::error::CaptureError;
use crate::fetch::{FetchError, ImageryProvider, TileRequest};
use crate::geo::{BoundingBox, SamplePoint};
use crate::grid::SampleSource;
use crate::manifest::{self, ClosedManifest, ManifestWriter};
use crate::metrics::Metrics;
use crate::sentinel::{is_no_imagery, SentinelPolicy};
use crate::tile::{headings, TileKey, TileList};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    pub source: SampleSource,
    /// Heading step and field of view, in degrees.
    pub theta: u32,
}

impl CaptureRequest {
    pub fn mesh(bbox: BoundingBox, density: u32, theta: u32) -> Self {
        Self {
            source: SampleSource::Mesh { bbox, density },
            theta,
        }
    }

    pub fn list(points: Vec<SamplePoint>, theta: u32) -> Self {
        Self {
            source: SampleSource::List(points),
            theta,
        }
    }

    /// Checks the request and expands it into sample points.
    pub fn points(&self) -> Result<Vec<SamplePoint>, CaptureError> {
        if !(1..=359).contains(&self.theta) {
            return Err(CaptureError::InvalidTheta(self.theta));
        }
        Ok(self.source.points()?)
    }
}

/// Outcome of one point's sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct PointCapture {
    pub point: SamplePoint,
    /// Accepted tile filenames in sweep order.
    pub tiles: Vec<String>,
    pub attempted: usize,
    pub failed: usize,
    pub sentinel_hit: bool,
}

impl PointCapture {
    fn new(point: SamplePoint) -> Self {
        Self {
            point,
            tiles: Vec::new(),
            attempted: 0,
            failed: 0,
            sentinel_hit: false,
        }
    }

    /// Colon-joined accepted filenames, empty when the point was rejected.
    pub fn joined(&self) -> String {
        self.tiles.join(":")
    }

    pub fn tile_list(&self) -> TileList {
        TileList::new(self.tiles.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    #[default]
    Idle,
    Sampling,
    ManifestClosed,
    Indexed,
    Failed,
}

impl RunPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            RunPhase::Idle => "idle",
            RunPhase::Sampling => "sampling",
            RunPhase::ManifestClosed => "manifest_closed",
            RunPhase::Indexed => "indexed",
            RunPhase::Failed => "failed",
        }
    }
}

impl FromStr for RunPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "idle" => Ok(RunPhase::Idle),
            "sampling" => Ok(RunPhase::Sampling),
            "manifest_closed" => Ok(RunPhase::ManifestClosed),
            "indexed" => Ok(RunPhase::Indexed),
            "failed" => Ok(RunPhase::Failed),
            other => Err(format!("unknown run phase '{other}'")),
        }
    }
}

/// Records the phase the last run reached, so a later process can tell whether
/// the manifest on disk was closed cleanly.
pub const PHASE_FILENAME: &str = "run_phase";

pub fn record_phase(corpus_dir: &Path, phase: RunPhase) -> Result<(), CaptureError> {
    let path = corpus_dir.join(PHASE_FILENAME);
    std::fs::write(&path, format!("{}\n", phase.as_str())).map_err(|source| io_error(&path, source))
}

/// Phase recorded by the last run on this corpus, `None` if no run ever started.
pub fn recorded_phase(corpus_dir: &Path) -> Result<Option<RunPhase>, CaptureError> {
    let path = corpus_dir.join(PHASE_FILENAME);
    match std::fs::read_to_string(&path) {
        Ok(text) => text
            .parse()
            .map(Some)
            .map_err(|e: String| io_error(&path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error(&path, e)),
    }
}

/// Snapshot of the most recent capture run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: Option<Uuid>,
    pub phase: RunPhase,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub points_total: usize,
    pub points_processed: usize,
    pub tiles_accepted: usize,
    pub manifest_entries: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Collaborators shared by every run of one corpus.
#[derive(Clone)]
pub struct CaptureContext {
    pub config: Arc<CorpusConfig>,
    pub provider: Arc<dyn ImageryProvider>,
    pub engine: Arc<dyn FeatureEngine>,
    pub metrics: Arc<Metrics>,
    fetch_permits: Arc<Semaphore>,
}

impl CaptureContext {
    pub fn new(
        config: Arc<CorpusConfig>,
        provider: Arc<dyn ImageryProvider>,
        engine: Arc<dyn FeatureEngine>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let fetch_permits = Arc::new(Semaphore::new(config.max_concurrent_fetches.max(1)));
        Self {
            config,
            provider,
            engine,
            metrics,
            fetch_permits,
        }
    }

    pub fn paths(&self) -> CorpusPaths {
        self.config.paths()
    }

    /// One provider round-trip under the global fetch limit. A timeout counts as
    /// a failed fetch.
    async fn fetch(&self, request: &TileRequest) -> Result<Bytes, FetchError> {
        let _permit = self
            .fetch_permits
            .acquire()
            .await
            .map_err(|_| FetchError::Provider("fetch pool closed".into()))?;

        let timeout = self.config.fetch_timeout;
        let timer = self.metrics.fetch_latency_seconds.start_timer();
        let result = tokio::time::timeout(timeout, self.provider.fetch(request)).await;
        timer.observe_duration();

        let bytes = result.map_err(|_| FetchError::Timeout(timeout))??;
        self.metrics.tiles_fetched_total.inc();
        Ok(bytes)
    }
}

/// Sweeps every `(heading, pitch)` of one point in order: heading ascending, then
/// pitch ascending. Tiles are written before the sentinel check and removed again
/// when they turn out to be the "no imagery" placeholder.
pub async fn capture_point(
    ctx: &CaptureContext,
    point: SamplePoint,
    theta: u32,
) -> Result<PointCapture, CaptureError> {
    let cfg = &ctx.config;
    let mut out = PointCapture::new(point);

    'sweep: for heading in headings(theta) {
        for &pitch in &cfg.pitches {
            let request = TileRequest {
                point,
                fov: theta,
                heading,
                pitch,
            };
            out.attempted += 1;

            let bytes = match ctx.fetch(&request).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(%point, heading, pitch, error = %e, "Tile fetch failed, skipping");
                    ctx.metrics.fetch_errors_total.inc();
                    out.failed += 1;
                    continue;
                }
            };

            let filename = TileKey::new(point, heading, pitch).filename(&cfg.tile_extension);
            let path = cfg.corpus_dir.join(&filename);
            tokio::fs::write(&path, &bytes)
                .await
                .map_err(|source| io_error(&path, source))?;

            let (sentinel, tolerance) = (cfg.sentinel_rgb, cfg.sentinel_tolerance);
            let verdict = tokio::task::spawn_blocking(move || is_no_imagery(&bytes, sentinel, tolerance))
                .await
                .map_err(|e| CaptureError::Task(e.to_string()))?;

            match verdict {
                Ok(false) => {
                    ctx.metrics.tiles_accepted_total.inc();
                    out.tiles.push(filename);
                }
                Ok(true) => {
                    remove_tile(&path).await?;
                    ctx.metrics.tiles_sentinel_total.inc();
                    out.sentinel_hit = true;
                    match cfg.sentinel_policy {
                        SentinelPolicy::AbortPoint => {
                            tracing::info!(%point, heading, pitch, "No imagery at point, abandoning sweep");
                            break 'sweep;
                        }
                        SentinelPolicy::SkipTile => {
                            tracing::info!(%point, heading, pitch, "No imagery for tile, skipping");
                        }
                    }
                }
                Err(e) => {
                    remove_tile(&path).await?;
                    tracing::warn!(%point, heading, pitch, error = %e, "Tile did not decode, skipping");
                    ctx.metrics.fetch_errors_total.inc();
                    out.failed += 1;
                }
            }
        }
    }

    Ok(out)
}

/// Sweep plus per-point feature computation. Owns its inputs so runs can hold
/// many of these in flight.
async fn process_point(
    ctx: CaptureContext,
    paths: CorpusPaths,
    point: SamplePoint,
    theta: u32,
) -> Result<PointCapture, CaptureError> {
    let capture = capture_point(&ctx, point, theta).await?;
    if !capture.tiles.is_empty() {
        ctx.engine
            .compute_features(&paths, &capture.tile_list())
            .await?;
    }
    Ok(capture)
}

async fn remove_tile(path: &Path) -> Result<(), CaptureError> {
    tokio::fs::remove_file(path)
        .await
        .map_err(|source| io_error(path, source))
}

fn io_error(path: &Path, source: std::io::Error) -> CaptureError {
    CaptureError::Io {
        path: path.to_path_buf(),
        source,
    }
}

async fn blocking<T, F>(f: F) -> Result<T, CaptureError>
where
    F: FnOnce() -> Result<T, manifest::ManifestError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CaptureError::Task(e.to_string()))?
        .map_err(CaptureError::from)
}

/// One capture run. The manifest writer lives only inside [`CaptureRun::sample`];
/// the index rebuild takes the [`ClosedManifest`] it produced.
pub struct CaptureRun {
    id: Uuid,
    phase: RunPhase,
    ctx: CaptureContext,
    paths: CorpusPaths,
    status: Arc<Mutex<RunStatus>>,
    closed: Option<ClosedManifest>,
}

impl CaptureRun {
    pub fn new(ctx: CaptureContext, status: Arc<Mutex<RunStatus>>) -> Self {
        let paths = ctx.paths();
        Self {
            id: Uuid::new_v4(),
            phase: RunPhase::Idle,
            ctx,
            paths,
            status,
            closed: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn manifest(&self) -> Option<&ClosedManifest> {
        self.closed.as_ref()
    }

    /// Samples, then rebuilds the index. Returns the final status snapshot.
    pub async fn run(mut self, request: CaptureRequest) -> Result<RunStatus, CaptureError> {
        self.sample(&request).await?;
        self.rebuild_index().await?;
        let status = self.status.lock().clone();
        Ok(status)
    }

    /// Truncates the manifest, clears old tiles, sweeps every point and closes the
    /// manifest. Malformed requests are rejected before anything on disk changes.
    pub async fn sample(&mut self, request: &CaptureRequest) -> Result<usize, CaptureError> {
        if self.phase != RunPhase::Idle {
            return Err(CaptureError::InvalidPhase {
                expected: RunPhase::Idle,
                actual: self.phase,
            });
        }
        let points = request.points()?;
        self.ctx.config.validate()?;

        let cfg = self.ctx.config.clone();
        let total = points.len();
        self.ctx.metrics.capture_runs_total.inc();
        self.ctx.metrics.capture_progress_ratio.set(0.0);
        *self.status.lock() = RunStatus {
            run_id: Some(self.id),
            phase: RunPhase::Sampling,
            started_at: Some(Utc::now()),
            points_total: total,
            ..RunStatus::default()
        };
        self.phase = RunPhase::Sampling;
        tracing::info!(run_id = %self.id, points = total, theta = request.theta, "Capture run started");

        let mut writer = match self.open_corpus().await {
            Ok(writer) => writer,
            Err(e) => return Err(self.fail(e)),
        };

        let theta = request.theta;
        let sampling = async {
            let pending: Vec<_> = points
                .into_iter()
                .map(|p| process_point(self.ctx.clone(), self.paths.clone(), p, theta))
                .collect();
            let mut results = futures::stream::iter(pending).buffered(cfg.point_concurrency);

            let mut processed = 0usize;
            while let Some(result) = results.next().await {
                let capture = result?;
                writer.record(&capture.point, &capture.tiles)?;
                processed += 1;
                self.progress(processed, total, &capture);
            }
            Ok::<_, CaptureError>(())
        };

        let outcome = match cfg.run_deadline {
            Some(deadline) => tokio::time::timeout(deadline, sampling)
                .await
                .unwrap_or(Err(CaptureError::DeadlineExceeded)),
            None => sampling.await,
        };

        // Close and reconcile whatever the outcome, so files match the manifest.
        let closed = match writer.close() {
            Ok(closed) => closed,
            Err(e) => return Err(self.fail(e.into())),
        };
        let (dir, ext, keep) = (cfg.corpus_dir.clone(), cfg.tile_extension.clone(), closed.tiles.clone());
        if let Err(e) = blocking(move || manifest::reconcile(&dir, &ext, &keep)).await {
            return Err(self.fail(e));
        }
        self.ctx.metrics.manifest_entries.set(closed.entries as i64);
        self.status.lock().manifest_entries = closed.entries;

        if let Err(e) = outcome {
            return Err(self.fail(e));
        }

        let entries = closed.entries;
        self.closed = Some(closed);
        self.set_phase(RunPhase::ManifestClosed);
        tracing::info!(run_id = %self.id, entries, "Sampling finished");
        Ok(entries)
    }

    /// Rebuilds the feature index over the closed manifest. Refused in any phase
    /// other than `ManifestClosed`, which also makes it run at most once.
    pub async fn rebuild_index(&mut self) -> Result<(), CaptureError> {
        let closed = match (self.phase, &self.closed) {
            (RunPhase::ManifestClosed, Some(closed)) => closed.clone(),
            (actual, _) => {
                return Err(CaptureError::InvalidPhase {
                    expected: RunPhase::ManifestClosed,
                    actual,
                })
            }
        };

        tracing::info!(run_id = %self.id, entries = closed.entries, "Rebuilding feature index");
        if let Err(e) = self.ctx.engine.rebuild_index(&self.paths, &closed).await {
            return Err(self.fail(e.into()));
        }

        self.ctx.metrics.index_rebuilds_total.inc();
        self.set_phase(RunPhase::Indexed);
        self.status.lock().finished_at = Some(Utc::now());
        tracing::info!(run_id = %self.id, "Capture run indexed");
        Ok(())
    }

    async fn open_corpus(&self) -> Result<ManifestWriter, CaptureError> {
        let cfg = &self.ctx.config;
        for dir in [&cfg.corpus_dir, &cfg.features_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| io_error(dir, source))?;
        }
        // before truncation, so an interrupted run never looks closed
        record_phase(&cfg.corpus_dir, RunPhase::Sampling)?;
        let (path, mode) = (cfg.manifest_path(), cfg.manifest_mode);
        let writer = blocking(move || ManifestWriter::create(&path, mode)).await?;

        let (dir, ext) = (cfg.corpus_dir.clone(), cfg.tile_extension.clone());
        let purged = blocking(move || manifest::purge_tiles(&dir, &ext)).await?;
        if purged > 0 {
            tracing::info!(run_id = %self.id, purged, "Removed tiles from the previous run");
        }
        Ok(writer)
    }

    fn progress(&self, processed: usize, total: usize, capture: &PointCapture) {
        let ratio = processed as f64 / total as f64;
        self.ctx.metrics.points_processed_total.inc();
        self.ctx.metrics.capture_progress_ratio.set(ratio);
        {
            let mut status = self.status.lock();
            status.points_processed = processed;
            status.tiles_accepted += capture.tiles.len();
        }
        tracing::info!(
            run_id = %self.id,
            point = %capture.point,
            tiles = capture.tiles.len(),
            failed = capture.failed,
            sentinel = capture.sentinel_hit,
            percent_complete = (ratio * 1000.0).round() / 10.0,
            "Point captured"
        );
    }

    fn set_phase(&mut self, phase: RunPhase) {
        self.phase = phase;
        self.status.lock().phase = phase;
        if let Err(e) = record_phase(&self.ctx.config.corpus_dir, phase) {
            tracing::warn!(run_id = %self.id, phase = phase.as_str(), error = %e, "Could not record run phase");
        }
    }

    fn fail(&mut self, error: CaptureError) -> CaptureError {
        tracing::error!(run_id = %self.id, phase = ?self.phase, error = %error, "Capture run failed");
        self.ctx.metrics.capture_failures_total.inc();
        if self.phase == RunPhase::ManifestClosed {
            // the manifest is complete, so the disk record stays indexable
            self.phase = RunPhase::Failed;
            self.status.lock().phase = RunPhase::Failed;
        } else {
            self.set_phase(RunPhase::Failed);
        }
        let mut status = self.status.lock();
        status.error = Some(error.to_string());
        status.finished_at = Some(Utc::now());
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{read_manifest, ManifestMode};
    use crate::testing::{EngineEvent, RecordingEngine, Reply, ScriptedProvider};
    use std::time::Duration;

    struct Harness {
        _dir: tempfile::TempDir,
        config: Arc<CorpusConfig>,
        provider: Arc<ScriptedProvider>,
        engine: Arc<RecordingEngine>,
        metrics: Arc<Metrics>,
        status: Arc<Mutex<RunStatus>>,
    }

    impl Harness {
        fn new(provider: ScriptedProvider, engine: RecordingEngine) -> Self {
            Self::with_config(provider, engine, |_| {})
        }

        fn with_config(
            provider: ScriptedProvider,
            engine: RecordingEngine,
            tweak: impl FnOnce(&mut CorpusConfig),
        ) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = CorpusConfig::with_root(dir.path());
            config.fetch_timeout = Duration::from_millis(200);
            tweak(&mut config);
            Self {
                _dir: dir,
                config: Arc::new(config),
                provider: Arc::new(provider),
                engine: Arc::new(engine),
                metrics: Arc::new(Metrics::new().unwrap()),
                status: Arc::default(),
            }
        }

        fn run(&self) -> CaptureRun {
            let ctx = CaptureContext::new(
                self.config.clone(),
                self.provider.clone(),
                self.engine.clone(),
                self.metrics.clone(),
            );
            CaptureRun::new(ctx, self.status.clone())
        }

        fn manifest_lines(&self) -> Vec<String> {
            read_manifest(&self.config.manifest_path()).unwrap()
        }

        fn tile_names(&self) -> Vec<String> {
            manifest::scan_tiles(&self.config.corpus_dir, "jpg")
                .unwrap()
                .into_iter()
                .map(|(name, _)| name)
                .collect()
        }
    }

    fn unit_box(theta: u32) -> CaptureRequest {
        CaptureRequest::mesh(BoundingBox::new(1.0, 1.0, 0.0, 0.0), 1, theta)
    }

    fn at(request: &TileRequest, lat: f64, lng: f64) -> bool {
        request.point == SamplePoint::new(lat, lng)
    }

    #[tokio::test]
    async fn unit_box_sweeps_four_corners_and_indexes_once() {
        let h = Harness::new(ScriptedProvider::always_imagery(), RecordingEngine::new());
        let status = h.run().run(unit_box(180)).await.unwrap();

        assert_eq!(h.provider.calls().len(), 4 * 2 * 4);
        assert_eq!(h.manifest_lines().len(), 32);
        assert_eq!(h.tile_names().len(), 32);
        assert_eq!(status.phase, RunPhase::Indexed);
        assert_eq!(status.points_processed, 4);
        assert_eq!(status.tiles_accepted, 32);

        let events = h.engine.events();
        assert_eq!(events.len(), 5);
        assert!(events[..4]
            .iter()
            .all(|e| matches!(e, EngineEvent::Features(t) if t.len() == 8)));
        match &events[4] {
            EngineEvent::Rebuild { lines_on_disk, tiles } => {
                assert_eq!(*lines_on_disk, 32);
                assert_eq!(tiles.len(), 32);
            }
            other => panic!("expected rebuild last, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sweep_order_is_heading_then_pitch() {
        let h = Harness::new(ScriptedProvider::always_imagery(), RecordingEngine::new());
        let ctx = CaptureContext::new(
            h.config.clone(),
            h.provider.clone(),
            h.engine.clone(),
            h.metrics.clone(),
        );
        std::fs::create_dir_all(&h.config.corpus_dir).unwrap();
        let capture = capture_point(&ctx, SamplePoint::new(2.5, 3.5), 120).await.unwrap();

        let order: Vec<(u32, i32)> = h.provider.calls().iter().map(|r| (r.heading, r.pitch)).collect();
        let expected: Vec<(u32, i32)> = [0, 120, 240]
            .iter()
            .flat_map(|&hd| [10, 20, 30, 40].map(move |p| (hd, p)))
            .collect();
        assert_eq!(order, expected);
        assert!(h.provider.calls().iter().all(|r| r.fov == 120));
        assert_eq!(capture.joined().split(':').count(), 12);
        assert!(capture.joined().starts_with("2.5,3.5,0,10.jpg:2.5,3.5,0,20.jpg"));
    }

    #[tokio::test]
    async fn sentinel_abandons_the_rest_of_the_point() {
        let provider = ScriptedProvider::new(|r| {
            if at(r, 0.0, 0.0) {
                Reply::NoImagery
            } else {
                Reply::Imagery
            }
        });
        let h = Harness::new(provider, RecordingEngine::new());
        h.run().run(unit_box(180)).await.unwrap();

        let calls_at_origin = h.provider.calls().iter().filter(|r| at(r, 0.0, 0.0)).count();
        assert_eq!(calls_at_origin, 1);
        assert!(!h.config.corpus_dir.join("0,0,0,10.jpg").exists());
        assert_eq!(h.manifest_lines().len(), 24);
        assert_eq!(h.tile_names().len(), 24);
        assert!(h.manifest_lines().iter().all(|l| !l.starts_with("0,0,")));
        assert_eq!(h.metrics.tiles_sentinel_total.get(), 1);
        // no features for a point without tiles
        let feature_calls = h
            .engine
            .events()
            .iter()
            .filter(|e| matches!(e, EngineEvent::Features(_)))
            .count();
        assert_eq!(feature_calls, 3);
    }

    #[tokio::test]
    async fn skip_tile_policy_keeps_sweeping() {
        let provider = ScriptedProvider::new(|r| {
            if at(r, 0.0, 0.0) && r.heading == 0 && r.pitch == 10 {
                Reply::NoImagery
            } else {
                Reply::Imagery
            }
        });
        let h = Harness::with_config(provider, RecordingEngine::new(), |c| {
            c.sentinel_policy = SentinelPolicy::SkipTile;
        });
        h.run().run(unit_box(180)).await.unwrap();

        assert_eq!(h.provider.calls().len(), 32);
        assert_eq!(h.manifest_lines().len(), 31);
        assert!(!h.config.corpus_dir.join("0,0,0,10.jpg").exists());
        assert!(h.config.corpus_dir.join("0,0,0,20.jpg").exists());
    }

    #[tokio::test]
    async fn failed_and_timed_out_fetches_only_drop_their_tile() {
        let provider = ScriptedProvider::new(|r| match (r.heading, r.pitch) {
            (180, 20) => Reply::Fail,
            (180, 30) => Reply::Hang,
            (180, 40) => Reply::Corrupt,
            _ => Reply::Imagery,
        });
        let h = Harness::new(provider, RecordingEngine::new());
        let status = h.run().run(unit_box(180)).await.unwrap();

        assert_eq!(status.phase, RunPhase::Indexed);
        assert_eq!(h.manifest_lines().len(), 4 * 5);
        assert_eq!(h.tile_names(), {
            let mut lines = h.manifest_lines();
            lines.sort();
            lines
        });
        assert_eq!(h.metrics.fetch_errors_total.get(), 12);
        assert!(!h.config.corpus_dir.join("1,1,180,40.jpg").exists());
    }

    #[tokio::test]
    async fn identical_requests_give_identical_manifests() {
        let script = |r: &TileRequest| if r.heading == 180 && at(r, 1.0, 0.0) { Reply::Fail } else { Reply::Imagery };
        let first = Harness::new(ScriptedProvider::new(script), RecordingEngine::new());
        let second = Harness::new(ScriptedProvider::new(script), RecordingEngine::new());
        first.run().run(unit_box(90)).await.unwrap();
        second.run().run(unit_box(90)).await.unwrap();
        assert_eq!(first.manifest_lines(), second.manifest_lines());

        // and again over the first corpus
        let before = first.manifest_lines();
        first.run().run(unit_box(90)).await.unwrap();
        assert_eq!(first.manifest_lines(), before);
        assert_eq!(first.tile_names().len(), before.len());
    }

    #[tokio::test]
    async fn previous_tiles_are_purged() {
        let h = Harness::new(ScriptedProvider::always_imagery(), RecordingEngine::new());
        std::fs::create_dir_all(&h.config.corpus_dir).unwrap();
        std::fs::write(h.config.corpus_dir.join("5,5,0,10.jpg"), b"stale").unwrap();
        std::fs::write(h.config.corpus_dir.join("notes.txt"), b"keep me").unwrap();

        h.run().run(CaptureRequest::list(vec![SamplePoint::new(1.0, 2.0)], 180)).await.unwrap();

        assert!(!h.config.corpus_dir.join("5,5,0,10.jpg").exists());
        assert!(h.config.corpus_dir.join("notes.txt").exists());
        assert_eq!(h.tile_names().len(), 8);
    }

    #[tokio::test]
    async fn point_mode_records_points_with_tiles() {
        let provider = ScriptedProvider::new(|r| if at(r, 1.0, 1.0) { Reply::NoImagery } else { Reply::Imagery });
        let h = Harness::with_config(provider, RecordingEngine::new(), |c| {
            c.manifest_mode = ManifestMode::Points;
        });
        h.run().run(unit_box(180)).await.unwrap();

        assert_eq!(h.manifest_lines(), vec!["0,0", "1,0", "0,1"]);
        assert_eq!(h.tile_names().len(), 24);
    }

    #[tokio::test]
    async fn deadline_closes_the_manifest_without_indexing() {
        let h = Harness::with_config(ScriptedProvider::new(|_| Reply::Hang), RecordingEngine::new(), |c| {
            c.fetch_timeout = Duration::from_secs(30);
            c.run_deadline = Some(Duration::from_millis(100));
        });
        let mut run = h.run();
        let err = run.sample(&unit_box(180)).await.unwrap_err();

        assert!(matches!(err, CaptureError::DeadlineExceeded));
        assert_eq!(run.phase(), RunPhase::Failed);
        assert!(matches!(
            run.rebuild_index().await,
            Err(CaptureError::InvalidPhase { actual: RunPhase::Failed, .. })
        ));
        assert_eq!(h.engine.rebuilds(), 0);
        assert!(h.manifest_lines().is_empty());
        assert!(h.tile_names().is_empty());
        assert_eq!(h.status.lock().phase, RunPhase::Failed);
    }

    #[tokio::test]
    async fn feature_failure_fails_the_run_and_keeps_files_consistent() {
        let h = Harness::new(ScriptedProvider::always_imagery(), RecordingEngine::new().failing_features());
        let err = h.run().run(unit_box(180)).await.unwrap_err();

        assert!(matches!(err, CaptureError::Engine(_)));
        assert_eq!(h.engine.rebuilds(), 0);
        assert_eq!(h.manifest_lines().len(), h.tile_names().len());
        let status = h.status.lock().clone();
        assert_eq!(status.phase, RunPhase::Failed);
        assert!(status.error.is_some());
        assert_eq!(h.metrics.capture_failures_total.get(), 1);
    }

    #[tokio::test]
    async fn rebuild_only_runs_from_manifest_closed() {
        let h = Harness::new(ScriptedProvider::always_imagery(), RecordingEngine::new());
        let mut run = h.run();
        assert!(matches!(
            run.rebuild_index().await,
            Err(CaptureError::InvalidPhase { actual: RunPhase::Idle, .. })
        ));

        run.sample(&unit_box(180)).await.unwrap();
        assert_eq!(run.phase(), RunPhase::ManifestClosed);
        assert_eq!(run.manifest().map(|m| m.entries), Some(32));
        run.rebuild_index().await.unwrap();
        assert_eq!(run.phase(), RunPhase::Indexed);

        assert!(matches!(
            run.rebuild_index().await,
            Err(CaptureError::InvalidPhase { actual: RunPhase::Indexed, .. })
        ));
        assert!(matches!(
            run.sample(&unit_box(180)).await,
            Err(CaptureError::InvalidPhase { expected: RunPhase::Idle, .. })
        ));
        assert_eq!(h.engine.rebuilds(), 1);
    }

    #[tokio::test]
    async fn bad_requests_leave_the_corpus_untouched() {
        let h = Harness::new(ScriptedProvider::always_imagery(), RecordingEngine::new());
        std::fs::create_dir_all(&h.config.corpus_dir).unwrap();
        std::fs::write(h.config.manifest_path(), "1,1,0,10.jpg\n").unwrap();

        for request in [
            unit_box(0),
            unit_box(360),
            CaptureRequest::mesh(BoundingBox::new(1.0, 1.0, 0.0, 0.0), 0, 90),
            CaptureRequest::mesh(BoundingBox::new(1.0, 1.0, 0.0, 0.0), 3_000_000, 90),
            CaptureRequest::list(Vec::new(), 90),
        ] {
            let mut run = h.run();
            assert!(run.sample(&request).await.is_err());
            assert_eq!(run.phase(), RunPhase::Idle);
        }
        assert_eq!(h.manifest_lines(), vec!["1,1,0,10.jpg"]);
        assert!(h.provider.calls().is_empty());
        assert_eq!(recorded_phase(&h.config.corpus_dir).unwrap(), None);
    }

    #[tokio::test]
    async fn phase_reached_is_recorded_on_disk() {
        let h = Harness::new(ScriptedProvider::always_imagery(), RecordingEngine::new());
        let mut run = h.run();
        run.sample(&unit_box(180)).await.unwrap();
        assert_eq!(recorded_phase(&h.config.corpus_dir).unwrap(), Some(RunPhase::ManifestClosed));
        run.rebuild_index().await.unwrap();
        assert_eq!(recorded_phase(&h.config.corpus_dir).unwrap(), Some(RunPhase::Indexed));

        let stopped = Harness::with_config(ScriptedProvider::new(|_| Reply::Hang), RecordingEngine::new(), |c| {
            c.fetch_timeout = Duration::from_secs(30);
            c.run_deadline = Some(Duration::from_millis(100));
        });
        assert!(stopped.run().run(unit_box(180)).await.is_err());
        assert_eq!(recorded_phase(&stopped.config.corpus_dir).unwrap(), Some(RunPhase::Failed));
    }

    #[tokio::test]
    async fn failed_rebuild_leaves_the_manifest_indexable() {
        let h = Harness::new(ScriptedProvider::always_imagery(), RecordingEngine::new().failing_rebuild());
        let mut run = h.run();
        run.sample(&unit_box(180)).await.unwrap();
        assert!(matches!(run.rebuild_index().await, Err(CaptureError::Engine(_))));

        assert_eq!(run.phase(), RunPhase::Failed);
        assert_eq!(h.status.lock().phase, RunPhase::Failed);
        assert_eq!(recorded_phase(&h.config.corpus_dir).unwrap(), Some(RunPhase::ManifestClosed));
    }

    #[test]
    fn phase_names_match_the_status_json() {
        for phase in [
            RunPhase::Idle,
            RunPhase::Sampling,
            RunPhase::ManifestClosed,
            RunPhase::Indexed,
            RunPhase::Failed,
        ] {
            assert_eq!(phase.as_str().parse::<RunPhase>(), Ok(phase));
            assert_eq!(serde_json::to_value(phase).unwrap(), serde_json::json!(phase.as_str()));
        }
        assert!("closed".parse::<RunPhase>().is_err());
    }
}
