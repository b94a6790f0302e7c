//! Approval endpoints.

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::auth::Caller;
use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::domain::models::{ApprovalDecision, Permission};
use crate::services::authorization::AuthScope;

#[derive(Debug, Deserialize)]
pub struct DecideRequest {
    pub decision: String,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DecideResponse {
    pub execution_id: Uuid,
    pub decision: String,
}

pub async fn decide(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path(approval_id): Path<Uuid>,
    Json(request): Json<DecideRequest>,
) -> ApiResult<Json<DecideResponse>> {
    let decision = ApprovalDecision::from_str(&request.decision).ok_or_else(|| {
        ApiError::bad_request(format!(
            "unknown decision '{}'; expected approve, reject, or request_changes",
            request.decision
        ))
    })?;

    let execution = state
        .executions
        .find_by_approval(approval_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("approval {approval_id} not found")))?;
    let approval = execution.approval(approval_id)?;

    let scope = AuthScope::approval(approval_id.to_string(), &approval.approvers);
    state.authz.require(&identity, Permission::ApprovalDecide, Some(&scope)).await?;

    let execution_id = state
        .engine
        .clone()
        .submit_approval(approval_id, decision, &identity.user_id, request.comment)
        .await?;
    Ok(Json(DecideResponse { execution_id, decision: decision.as_str().to_string() }))
}
