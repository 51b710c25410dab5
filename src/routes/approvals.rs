//! Approval routes
//!
//! A decision for a request that a running checkpoint is parked on goes
//! through the HTTP decision channel, so the gate applies it inside the run.
//! Any other pending request is resolved on the gate directly.

use crate::approval::{ApprovalRequest, ApprovalStatus, Decision};
use crate::error::{validation_error, ApiResult};
use crate::models::SuccessResponse;
use crate::state::SharedState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;
use validator::{Validate, ValidationError};

// =============================================================================
// REQUEST/RESPONSE TYPES
// =============================================================================

static APPROVER_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._@+-]*$").ok());

fn validate_approver(approver: &str) -> Result<(), ValidationError> {
    let valid = APPROVER_PATTERN
        .as_ref()
        .map(|re| re.is_match(approver))
        .unwrap_or(false);
    if !valid {
        let mut err = ValidationError::new("invalid_approver");
        err.message = Some("Approver must be a user name or email without spaces".into());
        return Err(err);
    }
    Ok(())
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRequest {
    #[validate(length(min = 1, max = 128, message = "Approver is required"))]
    #[validate(custom(function = "validate_approver"))]
    pub approver: String,
    #[serde(default)]
    pub comments: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApprovalListQuery {
    pub status: Option<ApprovalStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionResponse {
    pub request_id: Uuid,
    /// True when a waiting checkpoint received the decision
    pub delivered_to_checkpoint: bool,
    /// Resolved request, present when resolved directly on the gate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<ApprovalRequest>,
}

// =============================================================================
// HANDLERS
// =============================================================================

/// GET /api/approvals?status=pending
pub async fn list_approvals(
    State(state): State<SharedState>,
    Query(query): Query<ApprovalListQuery>,
) -> ApiResult<Json<SuccessResponse<Vec<ApprovalRequest>>>> {
    let approvals = match query.status {
        Some(ApprovalStatus::Pending) => state.gate.pending().await?,
        Some(status) => state
            .gate
            .list()
            .await?
            .into_iter()
            .filter(|r| r.status == status)
            .collect(),
        None => state.gate.list().await?,
    };
    Ok(Json(SuccessResponse::with_data(
        format!("{} approval requests", approvals.len()),
        approvals,
    )))
}

/// GET /api/approvals/{id}
pub async fn get_approval(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<ApprovalRequest>>> {
    let request = state.gate.status(id).await?;
    Ok(Json(SuccessResponse::with_data("Approval request", request)))
}

/// POST /api/approvals/{id}/approve
pub async fn approve(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DecisionRequest>,
) -> ApiResult<Json<SuccessResponse<DecisionResponse>>> {
    payload.validate().map_err(|e| validation_error(e.to_string()))?;
    let mut decision = Decision::approve(&payload.approver);
    decision.comments = payload.comments;
    decide(&state, id, decision).await
}

/// POST /api/approvals/{id}/reject
pub async fn reject(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DecisionRequest>,
) -> ApiResult<Json<SuccessResponse<DecisionResponse>>> {
    payload.validate().map_err(|e| validation_error(e.to_string()))?;
    let decision = Decision {
        approved: false,
        approver: payload.approver,
        comments: payload.comments,
    };
    decide(&state, id, decision).await
}

async fn decide(
    state: &SharedState,
    id: Uuid,
    decision: Decision,
) -> ApiResult<Json<SuccessResponse<DecisionResponse>>> {
    let verb = if decision.approved { "approved" } else { "rejected" };

    if state.decisions.submit(id, decision.clone()).await? {
        info!("Checkpoint {} {} by {}", id, verb, decision.approver);
        return Ok(Json(SuccessResponse::with_data(
            format!("Decision delivered to waiting checkpoint ({})", verb),
            DecisionResponse {
                request_id: id,
                delivered_to_checkpoint: true,
                request: None,
            },
        )));
    }

    let resolved = if decision.approved {
        state.gate.approve(id, &decision.approver, decision.comments).await?
    } else {
        state.gate.reject(id, &decision.approver, decision.comments).await?
    };
    Ok(Json(SuccessResponse::with_data(
        format!("Approval request {}", verb),
        DecisionResponse {
            request_id: id,
            delivered_to_checkpoint: false,
            request: Some(resolved),
        },
    )))
}
