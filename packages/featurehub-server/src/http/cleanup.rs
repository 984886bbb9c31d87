//! HTTP surface for the cleanup component (spec §6.1 "Cleanup", base
//! `/data-cleaner`).

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use featurehub_core::{CleanupRecord, CleanupType};
use serde::Deserialize;

use crate::cleanup::CleanupEngine;

#[derive(Clone)]
pub struct CleanupState {
    pub engine: Arc<CleanupEngine>,
}

#[derive(Debug, Deserialize)]
pub struct TriggerBody {
    pub cleanup_type: CleanupType,
    pub keys: Option<Vec<String>>,
}

/// `POST /data-cleaner/trigger` body `{cleanup_type, keys?}`.
pub async fn trigger(State(state): State<CleanupState>, Json(body): Json<TriggerBody>) -> Json<CleanupRecord> {
    let record = match body.cleanup_type {
        CleanupType::Expired => state.engine.run_expiry_sweep(body.keys).await,
        CleanupType::Orphan => state.engine.run_orphan_sweep(body.keys).await,
    };
    Json(record)
}

/// `GET /data-cleaner/statistics`.
pub async fn statistics(State(state): State<CleanupState>) -> Json<std::collections::HashMap<String, u64>> {
    Json(state.engine.statistics())
}

#[must_use]
pub fn build_router(state: CleanupState) -> Router {
    Router::new()
        .route("/data-cleaner/trigger", post(trigger))
        .route("/data-cleaner/statistics", get(statistics))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use featurehub_core::TestClock;
    use tower::ServiceExt;

    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::bus::NullEventBus;
    use crate::cleanup::CleanupConfig;
    use crate::metadata::store::memory::InMemoryMetadataStore;
    use crate::metadata::{MetadataCache, MetadataService};

    fn state() -> CleanupState {
        let clock = Arc::new(TestClock::new(0));
        let metadata = Arc::new(MetadataService::new(
            Arc::new(InMemoryMetadataStore::new()),
            MetadataCache::new(Duration::from_secs(60), clock.clone()),
            clock.clone(),
        ));
        let config = CleanupConfig::from(&crate::config::FeatureHubConfig::default());
        let engine = Arc::new(CleanupEngine::new(
            Arc::new(MemoryBackend::with_clock(clock.clone())),
            Arc::new(MemoryBackend::with_clock(clock.clone())),
            metadata,
            Arc::new(NullEventBus),
            clock,
            config,
        ));
        CleanupState { engine }
    }

    #[tokio::test]
    async fn trigger_orphan_with_no_keys_runs_full_scan() {
        let app = build_router(state());
        let req = Request::builder()
            .method("POST")
            .uri("/data-cleaner/trigger")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"cleanup_type":"ORPHAN_DATA"}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn statistics_returns_zero_counts_before_any_sweep() {
        let app = build_router(state());
        let req = Request::builder().uri("/data-cleaner/statistics").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
