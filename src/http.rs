use crate::catalog::{self, MetricDef, QueryError};
use crate::metrics::Metrics;
use crate::poller::{Poller, PollerStatus};
use crate::stats::Snapshot;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub poller: Arc<Poller>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiSnapshot {
    pub published_at: Option<String>,
    pub status: PollerStatus,
    pub snapshot: Option<Snapshot>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiMetricValue {
    pub key: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiError {
    pub error: String,
}

pub fn build_router(metrics: Arc<Metrics>, poller: Arc<Poller>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/metrics", get(catalog_handler))
        .route("/api/metric/:key", get(metric_handler))
        .route("/api/snapshot", get(snapshot_handler))
        .with_state(HttpAppState { metrics, poller })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    let snapshot = state.poller.snapshot();
    state
        .metrics
        .update(snapshot.as_ref(), &state.poller.status());
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn catalog_handler() -> Json<&'static [MetricDef]> {
    Json(catalog::CATALOG)
}

// Repeated `param` query pairs become the positional query parameters.
async fn metric_handler(
    State(state): State<HttpAppState>,
    Path(key): Path<String>,
    Query(query): Query<Vec<(String, String)>>,
) -> Response {
    let params: Vec<String> = query
        .into_iter()
        .filter(|(name, _)| name == "param")
        .map(|(_, value)| value)
        .collect();

    let snapshot = state.poller.snapshot();
    match catalog::export(snapshot.as_ref(), &key, &params) {
        Ok(value) => Json(ApiMetricValue { key, value }).into_response(),
        Err(err @ QueryError::UnsupportedMetric(_)) => (
            StatusCode::NOT_FOUND,
            Json(ApiError {
                error: err.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn snapshot_handler(State(state): State<HttpAppState>) -> Json<ApiSnapshot> {
    let status = state.poller.status();
    let published_at = status
        .published_at
        .map(|at| humantime::format_rfc3339_seconds(at).to_string());
    Json(ApiSnapshot {
        published_at,
        status,
        snapshot: state.poller.snapshot(),
    })
}
