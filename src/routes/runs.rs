//! Pipeline run routes
//!
//! Runs are started in the background; callers poll the snapshot and answer
//! checkpoints through the approval routes.

use crate::error::{not_found_error, validation_error, ApiResult};
use crate::models::SuccessResponse;
use crate::pipeline::types::{ChangeKind, Environment, PipelineRun, RunStatus, Stage};
use crate::pipeline::RunRequest;
use crate::state::SharedState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

// =============================================================================
// REQUEST/RESPONSE TYPES
// =============================================================================

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StartRunRequest {
    #[validate(length(min = 1, max = 4000, message = "Description must be between 1 and 4000 characters"))]
    pub description: String,
    pub change_kind: ChangeKind,
    #[serde(default = "default_working_context")]
    pub working_context: String,
    #[serde(default = "default_require_approvals")]
    pub require_approvals: bool,
    #[serde(default)]
    pub skip_design: bool,
    #[serde(default)]
    pub deploy_to: Vec<Environment>,
    #[validate(length(min = 1, message = "Build job name must not be empty"))]
    pub build_job: Option<String>,
    pub artifact_path: Option<PathBuf>,
    pub artifact_repository: Option<String>,
}

fn default_working_context() -> String {
    ".".to_string()
}

fn default_require_approvals() -> bool {
    true
}

impl From<StartRunRequest> for RunRequest {
    fn from(payload: StartRunRequest) -> Self {
        let mut request = RunRequest::new(payload.description, payload.change_kind);
        request.working_context = payload.working_context;
        request.require_approvals = payload.require_approvals;
        request.skip_design = payload.skip_design;
        request.deploy_to = payload.deploy_to;
        request.build_job = payload.build_job;
        request.artifact_path = payload.artifact_path;
        request.artifact_repository = payload.artifact_repository;
        request
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStarted {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub stage: Stage,
}

// =============================================================================
// HANDLERS
// =============================================================================

/// POST /api/runs
pub async fn start_run(
    State(state): State<SharedState>,
    Json(payload): Json<StartRunRequest>,
) -> ApiResult<(StatusCode, Json<SuccessResponse<RunStarted>>)> {
    payload.validate().map_err(|e| validation_error(e.to_string()))?;

    let request = RunRequest::from(payload);
    let run = PipelineRun::new(&request.description, request.change_kind);
    state.registry.publish(&run).await;

    let started = RunStarted {
        run_id: run.id,
        status: run.status,
        stage: run.stage,
    };
    info!("Accepted run {} ({})", run.id, run.change_kind);

    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        orchestrator.execute(run, request).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(SuccessResponse::with_data("Pipeline run started", started)),
    ))
}

/// GET /api/runs
pub async fn list_runs(State(state): State<SharedState>) -> ApiResult<Json<SuccessResponse<Vec<PipelineRun>>>> {
    let runs = state.registry.list().await;
    Ok(Json(SuccessResponse::with_data(format!("{} runs", runs.len()), runs)))
}

/// GET /api/runs/{id}
pub async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<PipelineRun>>> {
    let run = state
        .registry
        .get(id)
        .await
        .ok_or_else(|| not_found_error(format!("Pipeline run not found: {}", id)))?;
    Ok(Json(SuccessResponse::with_data("Pipeline run", run)))
}
