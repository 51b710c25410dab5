//! Deployment history and rollback routes

use crate::error::{validation_error, ApiResult};
use crate::models::SuccessResponse;
use crate::pipeline::types::{DeploymentRecord, Environment};
use crate::state::SharedState;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use tracing::info;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRequest {
    /// Defaults to the most recent successful version before the current one
    pub target_version: Option<String>,
    #[validate(length(min = 1, max = 1000, message = "A rollback reason is required"))]
    pub reason: String,
    #[validate(length(min = 1, max = 128, message = "Approver is required"))]
    pub approver: String,
}

fn parse_environment(raw: &str) -> ApiResult<Environment> {
    raw.parse().map_err(validation_error)
}

/// GET /api/deployments/{env}/history
pub async fn history(
    State(state): State<SharedState>,
    Path(environment): Path<String>,
) -> ApiResult<Json<SuccessResponse<Vec<DeploymentRecord>>>> {
    let environment = parse_environment(&environment)?;
    let records = state.governor.history().for_environment(environment).await;
    Ok(Json(SuccessResponse::with_data(
        format!("{} deployments to {}", records.len(), environment),
        records,
    )))
}

/// POST /api/deployments/{env}/rollback
pub async fn rollback(
    State(state): State<SharedState>,
    Path(environment): Path<String>,
    Json(payload): Json<RollbackRequest>,
) -> ApiResult<Json<SuccessResponse<DeploymentRecord>>> {
    payload.validate().map_err(|e| validation_error(e.to_string()))?;
    let environment = parse_environment(&environment)?;

    info!("Rollback of {} requested by {}", environment, payload.approver);
    let record = state
        .governor
        .rollback(
            environment,
            payload.target_version.as_deref(),
            &payload.reason,
            &payload.approver,
        )
        .await?;

    let message = if record.succeeded() {
        format!("Rolled {} back to {}", environment, record.artifact_version)
    } else {
        format!("Rollback of {} to {} failed", environment, record.artifact_version)
    };
    Ok(Json(SuccessResponse::with_data(message, record)))
}
