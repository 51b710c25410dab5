//! Audit trail routes

use crate::audit::{AuditEvent, AuditFilter};
use crate::error::ApiResult;
use crate::models::SuccessResponse;
use crate::state::SharedState;
use axum::{
    extract::{Query, State},
    Json,
};

/// Hard ceiling on events returned by one query
const MAX_EVENTS: usize = 1000;

/// GET /api/audit?runId=&agent=&limit=
pub async fn read_audit(
    State(state): State<SharedState>,
    Query(mut filter): Query<AuditFilter>,
) -> ApiResult<Json<SuccessResponse<Vec<AuditEvent>>>> {
    filter.limit = Some(filter.limit.unwrap_or(MAX_EVENTS).min(MAX_EVENTS));
    let events = state.audit.read(&filter).await?;
    Ok(Json(SuccessResponse::with_data(format!("{} audit events", events.len()), events)))
}
