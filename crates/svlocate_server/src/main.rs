mod config;
mod error;
mod metrics;
mod routes;

use crate::config::Config;
use crate::routes::AppState;
use anyhow::Context;
use std::sync::Arc;
use svcorpus::engine::ExternalEngine;
use svcorpus::{Corpus, Metrics, PlaceStore, StreetViewProvider};
use tokio::sync::watch;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let config = Config::from_env()?;
    tracing::info!(config = ?config, "Loaded configuration");

    let (shutdown_tx, shutdown_rx) = watch::channel(());

    let metrics = Arc::new(Metrics::new().context("Failed to create metrics registry")?);
    let places = Arc::new(PlaceStore::new());
    let provider = StreetViewProvider::new(config.fetch_config()).context("Failed to build imagery client")?;
    let engine = ExternalEngine::new(&config.engine_binary);
    let corpus = Corpus::new(
        config.corpus_config(),
        Arc::new(provider),
        Arc::new(engine),
        places.clone(),
        metrics.clone(),
    )
    .context("Invalid corpus configuration")?;
    tracing::info!(corpus = ?corpus, "Corpus ready");

    // Spawn the HTTP API
    let api_handle = {
        let state = AppState {
            corpus: Arc::new(corpus),
            places,
        };
        let app = routes::router(state, config.upload_limit_bytes);
        let addr = config.listen_addr;
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {addr}"))?;
            tracing::info!(%addr, "HTTP API listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = rx.changed().await;
                })
                .await
                .context("HTTP API failed")
        })
    };

    // Spawn the metrics server
    let metrics_handle = {
        let router = metrics::router(metrics.clone());
        let addr = config.metrics_listen_addr;
        let mut rx = shutdown_rx;
        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, router.into_make_service())
                .with_graceful_shutdown(async move {
                    let _ = rx.changed().await;
                })
                .await?;
            Ok::<(), anyhow::Error>(())
        })
    };

    tracing::info!("All services started. Awaiting shutdown signal...");
    shutdown_signal().await;

    tracing::info!("Shutdown signal received. Terminating services...");
    // Dropping the sender wakes every receiver.
    drop(shutdown_tx);

    let (api_res, metrics_res) = tokio::join!(api_handle, metrics_handle);
    match api_res {
        Ok(Err(e)) => tracing::error!(error = %e, "HTTP API task failed."),
        Err(e) => tracing::error!(error = %e, "HTTP API task panicked."),
        Ok(Ok(())) => {}
    }
    match metrics_res {
        Ok(Err(e)) => tracing::error!(error = %e, "Metrics server task failed."),
        Err(e) => tracing::error!(error = %e, "Metrics server task panicked."),
        Ok(Ok(())) => {}
    }

    tracing::info!("svlocate server shut down gracefully.");
    Ok(())
}

/// Listens for OS shutdown signals (SIGINT, SIGTERM) and resolves when one is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
