//! HTTP handlers for the REST API

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use tracing::instrument;

use crate::controller::{ControllerState, PassReport};

use super::dto::{ErrorResponse, HealthResponse};

/// Health check endpoint
#[instrument(skip(state))]
pub async fn health(State(state): State<Arc<ControllerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        dry_run: state.config.dry_run,
    })
}

/// Report of the most recent successful pass
#[instrument(skip(state))]
pub async fn last_report(
    State(state): State<Arc<ControllerState>>,
) -> Result<Json<PassReport>, (StatusCode, Json<ErrorResponse>)> {
    match state.last_report.read().await.as_ref() {
        Some(report) => Ok(Json(report.clone())),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(
                "no_report",
                "no reconciliation pass has completed yet",
            )),
        )),
    }
}
