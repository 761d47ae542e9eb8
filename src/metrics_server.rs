// HTTP server for metrics, health and the experiment summary
//
// Routes:
//   GET /         JSON summary of every stored experiment and its state
//   GET /metrics  Prometheus text exposition
//   GET /health   liveness probe

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::api::Experiment;
use crate::metrics;
use crate::store::ExperimentClient;

/// Shared state for the HTTP handlers
#[derive(Clone)]
pub struct ServerState {
    pub experiments: ExperimentClient,

    /// Namespace the summary is restricted to, if any
    pub namespace: Option<String>,
}

/// Body of `GET /`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryResponse {
    pub experiment_count: usize,
    pub summary: String,
}

impl SummaryResponse {
    pub fn from_experiments(experiments: &[Experiment]) -> Self {
        let summary = experiments
            .iter()
            .map(|e| {
                format!(
                    "{}, {}: {}\n",
                    e.metadata.namespace, e.metadata.name, e.result.state
                )
            })
            .collect();
        Self {
            experiment_count: experiments.len(),
            summary,
        }
    }
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/", get(summary_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Serve the router on `addr` until `cancel` fires
pub async fn start_server(addr: SocketAddr, state: ServerState, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind summary server on {}", addr))?;

    info!("Starting summary server on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Summary server error")?;

    info!("Summary server stopped");
    Ok(())
}

async fn summary_handler(State(state): State<ServerState>) -> Response {
    match state.experiments.list(state.namespace.as_deref()).await {
        Ok(experiments) => Json(SummaryResponse::from_experiments(&experiments)).into_response(),
        Err(e) => {
            error!("Failed to list experiments: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error listing experiments: {}", e),
            )
                .into_response()
        }
    }
}

/// Metrics endpoint handler
async fn metrics_handler() -> Response {
    match metrics::gather_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error gathering metrics: {}", e),
            )
                .into_response()
        }
    }
}

async fn health_handler() -> impl IntoResponse {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ExperimentState;
    use crate::store::{MemoryClient, ResourceClient, WriteOpts};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn state_with(experiments: Vec<Experiment>) -> ServerState {
        let client = Arc::new(MemoryClient::<Experiment>::new());
        for exp in experiments {
            client.write(exp, WriteOpts::default()).await.unwrap();
        }
        ServerState {
            experiments: client,
            namespace: None,
        }
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_summary_lists_experiments() {
        let mut failed = Experiment::new("chaos", "latency");
        failed.result.state = ExperimentState::Failed;
        let state = state_with(vec![Experiment::new("chaos", "abort"), failed]).await;

        let (status, body) = get(router(state), "/").await;
        assert_eq!(status, StatusCode::OK);

        let summary: SummaryResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(summary.experiment_count, 2);
        assert_eq!(summary.summary, "chaos, abort: Pending\nchaos, latency: Failed\n");
    }

    #[tokio::test]
    async fn test_summary_empty_store() {
        let (status, body) = get(router(state_with(vec![]).await), "/").await;
        assert_eq!(status, StatusCode::OK);
        let summary: SummaryResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(summary.experiment_count, 0);
        assert!(summary.summary.is_empty());
    }

    #[tokio::test]
    async fn test_health() {
        let (status, _) = get(router(state_with(vec![]).await), "/health").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let _ = metrics::init();
        metrics::EXPERIMENTS_STARTED_TOTAL.inc();
        let (status, body) = get(router(state_with(vec![]).await), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8(body).unwrap().contains("faultline_experiments_started_total"));
    }
}
