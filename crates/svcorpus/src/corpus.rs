use crate::capture::{self, CaptureContext, CaptureRequest, CaptureRun, RunPhase, RunStatus};
use crate::config::{ConfigError, CorpusConfig};
use crate::engine::{CorpusPaths, FeatureEngine};
use crate::error::{CaptureError, LocateError};
use crate::fetch::ImageryProvider;
use crate::locate::{self, LocationResult, StoredQuery};
use crate::manifest::{self, ClosedManifest};
use crate::metrics::Metrics;
use crate::places::PlacesLookup;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

/// Shared handle over one corpus directory.
///
/// Capture runs hold the corpus exclusively; locate queries share it. Neither
/// waits: a second capture is refused with [`CaptureError::Busy`], a capture
/// while queries are in flight with [`CaptureError::QueriesInFlight`], and a
/// query during a run with [`LocateError::Busy`].
pub struct Corpus {
    ctx: CaptureContext,
    places: Arc<dyn PlacesLookup>,
    access: Arc<RwLock<()>>,
    status: Arc<Mutex<RunStatus>>,
}

impl Corpus {
    pub fn new(
        config: CorpusConfig,
        provider: Arc<dyn ImageryProvider>,
        engine: Arc<dyn FeatureEngine>,
        places: Arc<dyn PlacesLookup>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            ctx: CaptureContext::new(Arc::new(config), provider, engine, metrics),
            places,
            access: Arc::new(RwLock::new(())),
            status: Arc::default(),
        })
    }

    pub fn config(&self) -> &CorpusConfig {
        &self.ctx.config
    }

    pub fn paths(&self) -> CorpusPaths {
        self.ctx.paths()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.ctx.metrics
    }

    pub fn status(&self) -> RunStatus {
        self.status.lock().clone()
    }

    /// Runs a full capture: sample, close the manifest, rebuild the index.
    ///
    /// The run is spawned so that a dropped caller (an HTTP client hanging up)
    /// cannot leave the manifest half written.
    pub async fn capture(&self, request: CaptureRequest) -> Result<RunStatus, CaptureError> {
        let guard = self.exclusive()?;
        let run = CaptureRun::new(self.ctx.clone(), self.status.clone());
        tracing::debug!(run_id = %run.id(), "Corpus locked for capture");

        tokio::spawn(async move {
            let _guard = guard;
            run.run(request).await
        })
        .await
        .map_err(|e| CaptureError::Task(e.to_string()))?
    }

    /// Locates a stored query photo, attaching nearby places when asked.
    pub async fn locate(&self, query: &StoredQuery, with_places: bool) -> Result<LocationResult, LocateError> {
        let _guard = self.access.try_read().map_err(|_| LocateError::Busy)?;
        let cfg = self.config();
        let metrics = &self.ctx.metrics;
        metrics.locate_requests_total.inc();

        let paths = self.paths();
        let result = if with_places {
            locate::locate_with_places(
                self.ctx.engine.as_ref(),
                self.places.as_ref(),
                &paths,
                query.path(),
                cfg.query_budget,
                cfg.places_radius_m,
            )
            .await?
        } else {
            locate::locate(self.ctx.engine.as_ref(), &paths, query.path(), cfg.query_budget).await?
        };

        if result.success {
            metrics.locate_matches_total.inc();
        }
        Ok(result)
    }

    /// Match counts of a stored query photo against every tile, as CSV.
    pub async fn match_report(&self, query: &StoredQuery) -> Result<String, LocateError> {
        let _guard = self.access.try_read().map_err(|_| LocateError::Busy)?;
        locate::match_report(
            self.ctx.engine.as_ref(),
            &self.paths(),
            query.path(),
            self.config().query_budget,
        )
        .await
    }

    /// Stores an upload under the configured upload directory.
    pub async fn store_query(&self, filename: &str, bytes: &[u8]) -> Result<StoredQuery, LocateError> {
        StoredQuery::store(&self.config().upload_dir, filename, bytes).await
    }

    /// Rebuilds the index over the manifest an earlier run left on disk. Refused
    /// unless that run got as far as closing its manifest.
    pub async fn rebuild_index(&self) -> Result<ClosedManifest, CaptureError> {
        let _guard = self.exclusive()?;
        let corpus_dir = &self.config().corpus_dir;
        match capture::recorded_phase(corpus_dir)? {
            Some(RunPhase::ManifestClosed | RunPhase::Indexed) => {}
            recorded => {
                return Err(CaptureError::InvalidPhase {
                    expected: RunPhase::ManifestClosed,
                    actual: recorded.unwrap_or_default(),
                })
            }
        }
        let closed = self.load_manifest()?;
        self.ctx.engine.rebuild_index(&self.paths(), &closed).await?;
        capture::record_phase(corpus_dir, RunPhase::Indexed)?;
        self.ctx.metrics.index_rebuilds_total.inc();
        tracing::info!(entries = closed.entries, "Feature index rebuilt from disk");
        Ok(closed)
    }

    /// Deletes tile files the manifest on disk does not list. Returns how many went.
    pub async fn reconcile(&self) -> Result<usize, CaptureError> {
        let _guard = self.exclusive()?;
        let closed = self.load_manifest()?;
        let cfg = self.config();
        Ok(manifest::reconcile(&cfg.corpus_dir, &cfg.tile_extension, &closed.tiles)?)
    }

    fn exclusive(&self) -> Result<OwnedRwLockWriteGuard<()>, CaptureError> {
        self.access.clone().try_write_owned().map_err(|_| {
            // readable means no writer holds it, so queries are what block us
            if self.access.try_read().is_ok() {
                CaptureError::QueriesInFlight
            } else {
                CaptureError::Busy
            }
        })
    }

    fn load_manifest(&self) -> Result<ClosedManifest, CaptureError> {
        let cfg = self.config();
        Ok(ClosedManifest::load(
            &cfg.manifest_path(),
            cfg.manifest_mode,
            &cfg.corpus_dir,
            &cfg.tile_extension,
        )?)
    }
}

impl std::fmt::Debug for Corpus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Corpus")
            .field("corpus_dir", &self.config().corpus_dir)
            .field("phase", &self.status.lock().phase)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{BoundingBox, SamplePoint};
    use crate::places::PlaceStore;
    use crate::testing::{solid_png, RecordingEngine, Reply, ScriptedProvider};
    use crate::tile::TileKey;
    use crate::triangulate::{MatchTable, TileMatch};
    use std::path::Path;
    use std::time::Duration;

    fn corpus(dir: &Path, provider: ScriptedProvider, engine: RecordingEngine) -> Arc<Corpus> {
        let mut config = CorpusConfig::with_root(dir);
        config.fetch_timeout = Duration::from_secs(5);
        Arc::new(
            Corpus::new(
                config,
                Arc::new(provider),
                Arc::new(engine),
                Arc::new(PlaceStore::new()),
                Arc::new(Metrics::new().unwrap()),
            )
            .unwrap(),
        )
    }

    fn request() -> CaptureRequest {
        CaptureRequest::mesh(BoundingBox::new(1.0, 1.0, 0.0, 0.0), 1, 180)
    }

    #[tokio::test]
    async fn capture_updates_status() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = corpus(dir.path(), ScriptedProvider::always_imagery(), RecordingEngine::new());
        assert_eq!(corpus.status().phase, RunPhase::Idle);

        let status = corpus.capture(request()).await.unwrap();
        assert_eq!(status.phase, RunPhase::Indexed);
        assert_eq!(status.manifest_entries, 32);
        assert!(status.run_id.is_some() && status.finished_at.is_some());
        assert_eq!(corpus.status(), status);
    }

    #[tokio::test]
    async fn queries_and_second_captures_are_refused_during_a_run() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(|r| {
            if r.point == SamplePoint::new(0.0, 0.0) {
                Reply::Hang
            } else {
                Reply::Imagery
            }
        });
        let corpus = corpus(dir.path(), provider, RecordingEngine::new());

        let running = {
            let corpus = corpus.clone();
            tokio::spawn(async move { corpus.capture(request()).await })
        };
        // wait until the run holds the corpus
        for _ in 0..100 {
            if corpus.status().phase == RunPhase::Sampling {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(matches!(corpus.capture(request()).await, Err(CaptureError::Busy)));
        let query = corpus.store_query("q.png", &solid_png([1, 2, 3], 32, 32)).await.unwrap();
        assert!(matches!(corpus.locate(&query, false).await, Err(LocateError::Busy)));
        assert!(matches!(corpus.match_report(&query).await, Err(LocateError::Busy)));

        running.abort();
    }

    #[tokio::test]
    async fn locate_counts_requests_and_matches() {
        let dir = tempfile::tempdir().unwrap();
        let table = MatchTable::new(vec![
            TileMatch {
                key: TileKey::new(SamplePoint::new(0.0, 0.0), 45, 10),
                matches: 40,
            },
            TileMatch {
                key: TileKey::new(SamplePoint::new(0.0, 2.0), 315, 10),
                matches: 30,
            },
        ]);
        let corpus = corpus(
            dir.path(),
            ScriptedProvider::always_imagery(),
            RecordingEngine::new().with_matches(table),
        );
        let query = corpus.store_query("q.jpg", &solid_png([1, 2, 3], 32, 32)).await.unwrap();
        let result = corpus.locate(&query, true).await.unwrap();

        assert!(result.success);
        assert_eq!(result.places, Some(Vec::new()));
        assert_eq!(corpus.metrics().locate_requests_total.get(), 1);
        assert_eq!(corpus.metrics().locate_matches_total.get(), 1);
    }

    #[tokio::test]
    async fn reconcile_and_rebuild_work_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = corpus(dir.path(), ScriptedProvider::always_imagery(), RecordingEngine::new());
        corpus.capture(request()).await.unwrap();

        let stray = corpus.config().corpus_dir.join("9,9,0,10.jpg");
        std::fs::write(&stray, b"left over").unwrap();
        assert_eq!(corpus.reconcile().await.unwrap(), 1);
        assert!(!stray.exists());

        let closed = corpus.rebuild_index().await.unwrap();
        assert_eq!(closed.entries, 32);
        assert_eq!(corpus.metrics().index_rebuilds_total.get(), 2);
    }

    #[tokio::test]
    async fn captures_are_refused_while_queries_are_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = corpus(dir.path(), ScriptedProvider::always_imagery(), RecordingEngine::new());

        let reading = corpus.access.try_read().unwrap();
        let err = corpus.capture(request()).await.unwrap_err();
        assert!(matches!(err, CaptureError::QueriesInFlight), "{err}");
        assert!(matches!(corpus.reconcile().await, Err(CaptureError::QueriesInFlight)));
        assert_eq!(corpus.status().phase, RunPhase::Idle);
        drop(reading);

        assert_eq!(corpus.capture(request()).await.unwrap().phase, RunPhase::Indexed);
    }

    #[tokio::test]
    async fn rebuild_from_disk_needs_a_cleanly_closed_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let engine = RecordingEngine::new().failing_features();
        let corpus = corpus(dir.path(), ScriptedProvider::always_imagery(), engine);

        // never captured here
        std::fs::create_dir_all(&corpus.config().corpus_dir).unwrap();
        std::fs::write(corpus.config().manifest_path(), "").unwrap();
        assert!(matches!(
            corpus.rebuild_index().await,
            Err(CaptureError::InvalidPhase { actual: RunPhase::Idle, .. })
        ));

        assert!(corpus.capture(request()).await.is_err());
        assert!(matches!(
            corpus.rebuild_index().await,
            Err(CaptureError::InvalidPhase { actual: RunPhase::Failed, .. })
        ));
        assert_eq!(corpus.metrics().index_rebuilds_total.get(), 0);
    }
}
