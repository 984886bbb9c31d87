//! HTTP surface for the metadata component (spec §6.1 "Metadata", base
//! `/api/v1/metadata`).

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use featurehub_core::{FeatureError, FeatureMetadata, StorageTier};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::metadata::{MetadataService, TierStats};

use super::ApiError;

#[derive(Clone)]
pub struct MetadataState {
    pub metadata: Arc<MetadataService>,
}

/// `GET /api/v1/metadata/{key}`.
pub async fn get_metadata(
    State(state): State<MetadataState>,
    Path(key): Path<String>,
) -> Result<Json<FeatureMetadata>, ApiError> {
    match state.metadata.get(&key).await? {
        Some(row) => Ok(Json(row)),
        None => Err(FeatureError::NotFound.into()),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateMetadataRequest {
    pub storage_tier: StorageTier,
    pub data_size: u64,
    pub ttl: Option<u64>,
    pub business_tag: Option<String>,
}

/// `POST /api/v1/metadata/{key}`: creates (or overwrites) a row directly,
/// bypassing the router's put-path storage-hint semantics -- this is the
/// metadata component's own administrative write.
pub async fn create_metadata(
    State(state): State<MetadataState>,
    Path(key): Path<String>,
    Json(req): Json<CreateMetadataRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if key.is_empty() || key.len() > featurehub_core::MAX_KEY_LENGTH {
        return Err(FeatureError::validation("key length out of bounds").into());
    }
    let now = chrono_now(&state).await;
    let record = FeatureMetadata::new_for_write(key, req.storage_tier, req.data_size, now, req.ttl, req.business_tag);
    let outcome = state.metadata.upsert(record).await?;
    Ok(Json(json!({ "created": outcome.created })))
}

/// `PUT /api/v1/metadata/{key}`: full-row replace. No-op (`updated: false`)
/// if the row doesn't already exist.
pub async fn update_metadata(
    State(state): State<MetadataState>,
    Path(key): Path<String>,
    Json(mut record): Json<FeatureMetadata>,
) -> Result<Json<serde_json::Value>, ApiError> {
    record.key_name = key;
    let updated = state.metadata.update(record).await?;
    Ok(Json(json!({ "updated": updated })))
}

/// `DELETE /api/v1/metadata/{key}`.
pub async fn delete_metadata(
    State(state): State<MetadataState>,
    Path(key): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = state.metadata.delete(&key).await?;
    Ok(Json(json!({ "deleted": deleted })))
}

#[derive(Debug, Deserialize)]
pub struct BatchKeysRequest {
    pub keys: Vec<String>,
}

/// `POST /api/v1/metadata/batch`.
pub async fn batch_get_metadata(
    State(state): State<MetadataState>,
    Json(req): Json<BatchKeysRequest>,
) -> Result<Json<HashMap<String, FeatureMetadata>>, ApiError> {
    if req.keys.len() > 10_000 {
        return Err(FeatureError::validation("batch too large").into());
    }
    Ok(Json(state.metadata.batch_get(&req.keys).await?))
}

#[derive(Debug, Deserialize)]
pub struct BatchUpdateRequest {
    pub records: Vec<FeatureMetadata>,
}

/// `PUT /api/v1/metadata/batch`.
pub async fn batch_update_metadata(
    State(state): State<MetadataState>,
    Json(req): Json<BatchUpdateRequest>,
) -> Result<Json<HashMap<String, bool>>, ApiError> {
    Ok(Json(state.metadata.batch_update(req.records).await?))
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub storage_type: Option<String>,
    pub business_tag: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum StatsResponse {
    ByTier(HashMap<String, u64>),
    Single(TierStats),
}

/// `GET /api/v1/metadata/stats?storage_type=&business_tag=`.
pub async fn stats(
    State(state): State<MetadataState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<StatsResponse>, ApiError> {
    if let Some(tag) = query.business_tag {
        return Ok(Json(StatsResponse::Single(state.metadata.stats_by_tag(&tag).await?)));
    }
    if let Some(storage_type) = query.storage_type {
        let tier = match storage_type.to_ascii_lowercase().as_str() {
            "hot" => StorageTier::Hot,
            "cold" => StorageTier::Cold,
            other => return Err(FeatureError::validation(format!("unknown storage_type '{other}'")).into()),
        };
        return Ok(Json(StatsResponse::Single(state.metadata.stats_by_tier(tier).await?)));
    }
    let counts = state.metadata.count_by_tier().await?;
    Ok(Json(StatsResponse::ByTier(counts.into_iter().map(|(tier, count)| (tier.as_str().to_string(), count)).collect())))
}

/// `POST /api/v1/metadata/cleanup`: purges metadata rows past their
/// `expire_time` directly (a lighter-weight cousin of the standalone
/// cleanup component's expiry sweep, which also removes store copies).
pub async fn cleanup(State(state): State<MetadataState>) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = state.metadata.delete_expired().await?;
    Ok(Json(json!({ "deleted": deleted })))
}

async fn chrono_now(_state: &MetadataState) -> i64 {
    // Record-creation timestamps for administrative writes use wall-clock
    // time directly; the metadata service's own clock governs TTL/idle
    // math for everything it derives afterward.
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[must_use]
pub fn build_router(state: MetadataState) -> Router {
    Router::new()
        .route("/api/v1/metadata/batch", post(batch_get_metadata).put(batch_update_metadata))
        .route("/api/v1/metadata/stats", get(stats))
        .route("/api/v1/metadata/cleanup", post(cleanup))
        .route(
            "/api/v1/metadata/{key}",
            get(get_metadata).post(create_metadata).put(update_metadata).delete(delete_metadata),
        )
        .with_state(state)
}
