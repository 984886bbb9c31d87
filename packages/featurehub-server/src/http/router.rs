//! HTTP surface for the router component (spec §6.1 "Router", base `/api/v1`).

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use featurehub_core::{FeatureError, StorageTier};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::router::{BatchGetOptions, FeatureResult, GetOptions, PutOptions, RouterService};

use super::ApiError;

#[derive(Clone)]
pub struct RouterState {
    pub router: Arc<RouterService>,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Deserialize, Default)]
pub struct GetQuery {
    #[serde(default)]
    pub include_metadata: bool,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct FeatureResultBody {
    pub found: bool,
    pub value: Option<String>,
    pub source: Option<&'static str>,
    pub query_time_ms: u64,
    pub error: Option<String>,
}

impl From<FeatureResult> for FeatureResultBody {
    fn from(r: FeatureResult) -> Self {
        Self {
            found: r.found,
            value: r.value,
            source: r.tier.map(StorageTier::as_str),
            query_time_ms: r.query_time_ms,
            error: r.error,
        }
    }
}

/// `GET /api/v1/feature/{key}?include_metadata={bool}&timeout_ms={int}`.
pub async fn get_feature(
    State(state): State<RouterState>,
    Path(key): Path<String>,
    Query(query): Query<GetQuery>,
) -> Json<FeatureResultBody> {
    let result = state
        .router
        .get(&key, GetOptions { include_metadata: query.include_metadata, timeout_ms: query.timeout_ms, ..Default::default() })
        .await;
    Json(result.into())
}

#[derive(Debug, Deserialize, Default)]
pub struct BatchGetRequestOptions {
    #[serde(default)]
    pub include_metadata: bool,
    pub timeout_ms: Option<u64>,
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BatchGetRequest {
    pub keys: Vec<String>,
    #[serde(default)]
    pub options: BatchGetRequestOptions,
}

#[derive(Debug, Serialize)]
pub struct BatchSummaryBody {
    pub total: usize,
    pub found: usize,
    pub not_found: usize,
    pub hot_hits: usize,
    pub cold_hits: usize,
    pub total_time_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct BatchResponseBody {
    pub results: Vec<FeatureResultBody>,
    pub summary: BatchSummaryBody,
}

/// `POST /api/v1/features/batch`.
pub async fn batch_get_feature(
    State(state): State<RouterState>,
    Json(req): Json<BatchGetRequest>,
) -> Result<Json<BatchResponseBody>, ApiError> {
    if req.keys.len() > 10_000 {
        return Err(FeatureError::validation("batch too large").into());
    }

    let opts = BatchGetOptions {
        include_metadata: req.options.include_metadata,
        timeout_ms: req.options.timeout_ms,
        user_id: req.options.user_id,
    };
    let batch = state.router.batch_get(&req.keys, opts).await;
    Ok(Json(BatchResponseBody {
        results: batch.results.into_iter().map(Into::into).collect(),
        summary: BatchSummaryBody {
            total: batch.summary.total,
            found: batch.summary.found,
            not_found: batch.summary.not_found,
            hot_hits: batch.summary.hot_hits,
            cold_hits: batch.summary.cold_hits,
            total_time_ms: batch.summary.total_time_ms,
        },
    }))
}

#[derive(Debug, Deserialize)]
pub struct PutFeatureRequest {
    pub value: String,
    pub ttl: Option<u64>,
    pub storage_hint: Option<String>,
}

/// `PUT /api/v1/feature/{key}` body `{value, ttl?, storage_hint?}`.
pub async fn put_feature(
    State(state): State<RouterState>,
    Path(key): Path<String>,
    Json(req): Json<PutFeatureRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let storage_hint = match req.storage_hint.as_deref() {
        Some("hot") => Some(StorageTier::Hot),
        Some("cold") => Some(StorageTier::Cold),
        Some(other) => return Err(FeatureError::validation(format!("unknown storage_hint '{other}'")).into()),
        None => None,
    };

    let result = state.router.put(&key, req.value, PutOptions { ttl_secs: req.ttl, storage_hint }).await?;
    Ok(Json(json!({ "tier": result.tier.as_str(), "ttl": result.ttl_secs })))
}

/// `GET /metrics`. Renders the process-wide Prometheus recorder this
/// component installed at startup; an empty body if none was installed
/// (e.g. running with `--no-metrics` in a test harness).
pub async fn metrics_handler(State(state): State<RouterState>) -> String {
    state.metrics.as_ref().map(PrometheusHandle::render).unwrap_or_default()
}

#[must_use]
pub fn build_router(state: RouterState) -> Router {
    Router::new()
        .route("/api/v1/feature/{key}", get(get_feature).put(put_feature))
        .route("/api/v1/features/batch", post(batch_get_feature))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use featurehub_core::SystemClock;
    use tower::ServiceExt;

    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::bus::NullEventBus;
    use crate::metadata::store::memory::InMemoryMetadataStore;
    use crate::metadata::{MetadataCache, MetadataService};
    use crate::router::stats_queue::StatsQueue;

    fn state() -> RouterState {
        let clock: Arc<dyn featurehub_core::Clock> = Arc::new(SystemClock);
        let metadata = Arc::new(MetadataService::new(
            Arc::new(InMemoryMetadataStore::new()),
            MetadataCache::new(Duration::from_secs(60), clock.clone()),
            clock.clone(),
        ));
        let stats_queue = StatsQueue::spawn(metadata.clone(), 100, 1);
        let router = Arc::new(RouterService::new(
            Arc::new(MemoryBackend::with_clock(clock.clone())),
            Arc::new(MemoryBackend::with_clock(clock.clone())),
            metadata,
            Arc::new(NullEventBus),
            clock,
            stats_queue,
            Duration::from_secs(5),
        ));
        RouterState { router, metrics: None }
    }

    #[tokio::test]
    async fn put_then_get_round_trips_over_http() {
        let app = build_router(state());

        let put_req = Request::builder()
            .method("PUT")
            .uri("/api/v1/feature/user:1:age")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"value":"25","ttl":3600}"#))
            .unwrap();
        let resp = app.clone().oneshot(put_req).await.unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);

        let get_req = Request::builder().uri("/api/v1/feature/user:1:age").body(Body::empty()).unwrap();
        let resp = app.oneshot(get_req).await.unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn get_missing_key_returns_200_not_found_false() {
        let app = build_router(state());
        let req = Request::builder().uri("/api/v1/feature/missing").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn put_with_unknown_storage_hint_is_a_400() {
        let app = build_router(state());
        let req = Request::builder()
            .method("PUT")
            .uri("/api/v1/feature/k")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"value":"v","storage_hint":"lukewarm"}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::BAD_REQUEST);
    }
}
