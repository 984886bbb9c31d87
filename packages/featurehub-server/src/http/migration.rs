//! HTTP surface for the migration component (spec §6.1 "Migration", base
//! `/api/migration`).

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use featurehub_core::{MigrationRecord, MigrationType};
use serde::Deserialize;
use serde_json::json;

use crate::migration::{MigrationConfig, MigrationEngine, TriggerRequest};

use super::ApiError;

#[derive(Clone)]
pub struct MigrationState {
    pub engine: Arc<MigrationEngine>,
}

#[derive(Debug, Deserialize)]
pub struct TriggerBody {
    pub task_type: MigrationType,
    pub keys: Option<Vec<String>>,
    pub business_tag: Option<String>,
    /// Accepted for wire compatibility with spec §6.1's request shape;
    /// every trigger runs to completion before responding regardless --
    /// there is no fire-and-forget task queue behind this component.
    #[serde(default)]
    pub r#async: bool,
}

/// `POST /api/migration/trigger`.
pub async fn trigger(
    State(state): State<MigrationState>,
    Json(body): Json<TriggerBody>,
) -> Json<MigrationRecord> {
    let record = state.engine.trigger(body.task_type, TriggerRequest { keys: body.keys, business_tag: body.business_tag }).await;
    Json(record)
}

/// `GET /api/migration/records?limit={int}`.
#[derive(Debug, Deserialize)]
pub struct RecordsQuery {
    pub limit: Option<usize>,
}

pub async fn records(State(state): State<MigrationState>, axum::extract::Query(query): axum::extract::Query<RecordsQuery>) -> Json<Vec<Arc<MigrationRecord>>> {
    Json(state.engine.records().list_recent(query.limit.unwrap_or(100)))
}

/// `GET /api/migration/statistics`.
pub async fn statistics(State(state): State<MigrationState>) -> Json<std::collections::HashMap<String, u64>> {
    Json(state.engine.statistics())
}

/// `GET /api/migration/config`.
pub async fn config(State(state): State<MigrationState>) -> Json<MigrationConfig> {
    Json(state.engine.config().clone())
}

/// `POST /api/migration/pause`.
pub async fn pause(State(state): State<MigrationState>) -> Json<serde_json::Value> {
    state.engine.pause();
    Json(json!({ "paused": true }))
}

/// `POST /api/migration/resume`.
pub async fn resume(State(state): State<MigrationState>) -> Json<serde_json::Value> {
    state.engine.resume();
    Json(json!({ "paused": false }))
}

#[derive(Debug, Deserialize)]
pub struct EstimateBody {
    pub task_type: MigrationType,
}

/// `POST /api/migration/estimate`.
pub async fn estimate(
    State(state): State<MigrationState>,
    Json(body): Json<EstimateBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let estimate = state.engine.estimate(body.task_type).await?;
    Ok(Json(json!({ "candidate_count": estimate.candidate_count })))
}

#[must_use]
pub fn build_router(state: MigrationState) -> Router {
    Router::new()
        .route("/api/migration/trigger", post(trigger))
        .route("/api/migration/records", get(records))
        .route("/api/migration/statistics", get(statistics))
        .route("/api/migration/config", get(config))
        .route("/api/migration/pause", post(pause))
        .route("/api/migration/resume", post(resume))
        .route("/api/migration/estimate", post(estimate))
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
    use crate::metadata::store::memory::InMemoryMetadataStore;
    use crate::metadata::{MetadataCache, MetadataService};

    fn state() -> MigrationState {
        let clock = Arc::new(TestClock::new(0));
        let metadata = Arc::new(MetadataService::new(
            Arc::new(InMemoryMetadataStore::new()),
            MetadataCache::new(Duration::from_secs(60), clock.clone()),
            clock.clone(),
        ));
        let config = MigrationConfig::from(&crate::config::FeatureHubConfig::default());
        let engine = Arc::new(MigrationEngine::new(
            Arc::new(MemoryBackend::with_clock(clock.clone())),
            Arc::new(MemoryBackend::with_clock(clock.clone())),
            metadata,
            Arc::new(NullEventBus),
            clock,
            config,
        ));
        MigrationState { engine }
    }

    #[tokio::test]
    async fn trigger_with_explicit_keys_runs_synchronously() {
        let app = build_router(state());
        let req = Request::builder()
            .method("POST")
            .uri("/api/migration/trigger")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"task_type":"HOT_TO_COLD","keys":[]}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn pause_then_resume() {
        let app = build_router(state());
        let pause_req = Request::builder().method("POST").uri("/api/migration/pause").body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(pause_req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resume_req = Request::builder().method("POST").uri("/api/migration/resume").body(Body::empty()).unwrap();
        let resp = app.oneshot(resume_req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
