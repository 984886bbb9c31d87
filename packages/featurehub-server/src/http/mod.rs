//! Axum HTTP handler layer (spec §6.1): one router-building function per
//! component, sharing the mapping from [`FeatureError`] to a JSON error
//! response.

pub mod cleanup;
pub mod metadata;
pub mod migration;
pub mod router;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use featurehub_core::FeatureError;
use serde_json::json;

/// Wraps [`FeatureError`] so handlers can `?`-propagate it and get the
/// right status code (spec §7 "Kinds").
pub struct ApiError(pub FeatureError);

impl From<FeatureError> for ApiError {
    fn from(err: FeatureError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FeatureError::NotFound => StatusCode::NOT_FOUND,
            FeatureError::Validation { .. } => StatusCode::BAD_REQUEST,
            FeatureError::Conflict => StatusCode::CONFLICT,
            FeatureError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            FeatureError::BackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            FeatureError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
