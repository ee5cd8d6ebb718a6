use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use std::sync::Arc;
use svcorpus::Metrics;

/// Serves the corpus collectors on `/metrics`.
pub fn router(metrics: Arc<Metrics>) -> Router {
    Router::new().route(
        "/metrics",
        get(move || {
            let metrics = metrics.clone();
            async move {
                match metrics.encode() {
                    Ok(text) => text.into_response(),
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to encode metrics");
                        StatusCode::INTERNAL_SERVER_ERROR.into_response()
                    }
                }
            }
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn exposes_prefixed_collectors() {
        let metrics = Arc::new(Metrics::new().unwrap());
        metrics.capture_runs_total.inc();
        let response = router(metrics)
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("svlocate_capture_runs_total 1"));
    }
}
