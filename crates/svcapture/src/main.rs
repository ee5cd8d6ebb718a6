mod config;

use crate::config::{Command, Config};
use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use svcorpus::engine::ExternalEngine;
use svcorpus::grid::parse_point_list;
use svcorpus::{CaptureRequest, Corpus, Metrics, PlaceStore, StreetViewProvider};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();
    let config = Config::parse();
    tracing::info!(config = ?config, "svcapture starting with configuration");

    if matches!(config.command, Command::Capture { .. }) && config.streetview_key.is_none() {
        anyhow::bail!("SVLOCATE_STREETVIEW_KEY (or --streetview-key) must be set to capture");
    }

    let provider = StreetViewProvider::new(config.fetch_config()).context("Failed to build imagery client")?;
    let corpus = Corpus::new(
        config.corpus_config(),
        Arc::new(provider),
        Arc::new(ExternalEngine::new(&config.engine_binary)),
        Arc::new(PlaceStore::new()),
        Arc::new(Metrics::new().context("Failed to create metrics registry")?),
    )
    .context("Invalid corpus configuration")?;

    match config.command {
        Command::Capture {
            theta,
            bbox,
            density,
            points,
        } => {
            let request = match (points, bbox) {
                (Some(path), _) => {
                    let text = tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("Failed to read point list {}", path.display()))?;
                    CaptureRequest::list(parse_point_list(&text)?, theta)
                }
                (None, Some(bbox)) => CaptureRequest::mesh(bbox, density, theta),
                (None, None) => anyhow::bail!("either --bbox or --points is required"),
            };
            let status = corpus.capture(request).await.context("Capture run failed")?;
            tracing::info!(
                run_id = ?status.run_id,
                points = status.points_processed,
                tiles = status.tiles_accepted,
                manifest_entries = status.manifest_entries,
                "Capture run complete"
            );
        }
        Command::Index => {
            let closed = corpus.rebuild_index().await.context("Index rebuild failed")?;
            tracing::info!(entries = closed.entries, "Index rebuilt");
        }
        Command::Reconcile => {
            let removed = corpus.reconcile().await.context("Reconciliation failed")?;
            tracing::info!(removed, "Corpus reconciled");
        }
    }
    Ok(())
}
