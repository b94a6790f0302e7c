//! Execution endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use uuid::Uuid;

use super::auth::Caller;
use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::domain::models::{
    DefinitionStatus, ExecutionStatus, Permission, ProcessExecution, Role, TriggeredBy, Version,
};
use crate::services::authorization::AuthScope;

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    pub process_name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub input: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub execution_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ListExecutionsQuery {
    pub status: Option<String>,
    pub process_id: Option<Uuid>,
    #[serde(default)]
    pub limit: Option<u32>,
}

pub async fn trigger(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Json(request): Json<TriggerRequest>,
) -> ApiResult<(StatusCode, Json<TriggerResponse>)> {
    state.authz.require(&identity, Permission::ExecutionTrigger, None).await?;

    let version = match request.version.as_deref() {
        Some(v) => Some(
            Version::parse(v)
                .ok_or_else(|| ApiError::bad_request(format!("invalid version '{v}'")))?,
        ),
        None => None,
    };

    // Surface archived processes as 410 instead of a generic conflict.
    if let Some(definition) =
        state.definitions.get_by_name(&request.process_name, version).await?
    {
        if definition.status == DefinitionStatus::Archived {
            return Err(ApiError::gone(format!(
                "process {} v{} is archived",
                definition.name, definition.version
            )));
        }
    }

    let execution_id = state
        .engine
        .clone()
        .start(
            &request.process_name,
            version,
            request.input,
            TriggeredBy::manual(&identity.user_id),
            &identity.user_id,
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(TriggerResponse { execution_id })))
}

/// Webhook trigger: the payload becomes the execution input. Only processes
/// declaring a webhook trigger accept it.
pub async fn webhook_trigger(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path(process_name): Path<String>,
    Json(payload): Json<serde_json::Value>,
) -> ApiResult<(StatusCode, Json<TriggerResponse>)> {
    state.authz.require(&identity, Permission::ExecutionTrigger, None).await?;

    let definition = state
        .definitions
        .latest_published(&process_name)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("process {process_name} not found")))?;
    if !definition.has_webhook_trigger() {
        return Err(ApiError::bad_request(format!(
            "process {process_name} does not declare a webhook trigger"
        )));
    }

    let execution_id = state
        .engine
        .clone()
        .start(
            &process_name,
            None,
            payload,
            TriggeredBy::webhook(&identity.user_id),
            &identity.user_id,
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(TriggerResponse { execution_id })))
}

pub async fn list(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Query(query): Query<ListExecutionsQuery>,
) -> ApiResult<Json<Vec<ProcessExecution>>> {
    state.authz.require(&identity, Permission::ExecutionView, None).await?;

    let executions = match (query.process_id, query.status.as_deref()) {
        (Some(process_id), _) => {
            state
                .executions
                .list_history(process_id, query.limit.unwrap_or(100))
                .await?
        }
        (None, Some(status)) => {
            let status = ExecutionStatus::from_str(status)
                .ok_or_else(|| ApiError::bad_request(format!("unknown status '{status}'")))?;
            state.executions.list_by_status(&[status]).await?
        }
        (None, None) => {
            state
                .executions
                .list_by_status(&[
                    ExecutionStatus::Pending,
                    ExecutionStatus::Running,
                    ExecutionStatus::Paused,
                    ExecutionStatus::Completed,
                    ExecutionStatus::Failed,
                    ExecutionStatus::Cancelled,
                ])
                .await?
        }
    };

    // Viewers see only executions in their own scope.
    let visible = if identity.role == Role::Viewer {
        executions
            .into_iter()
            .filter(|e| e.owner_user == identity.user_id || e.owner_team == identity.team)
            .collect()
    } else {
        executions
    };
    Ok(Json(visible))
}

pub async fn get(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ProcessExecution>> {
    let execution = load(&state, id).await?;
    let scope = AuthScope::execution(id.to_string(), &execution.owner_team, &execution.owner_user);
    state.authz.require(&identity, Permission::ExecutionView, Some(&scope)).await?;
    Ok(Json(execution))
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn cancel(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path(id): Path<Uuid>,
    Json(request): Json<CancelRequest>,
) -> ApiResult<StatusCode> {
    let execution = load(&state, id).await?;
    let scope = AuthScope::execution(id.to_string(), &execution.owner_team, &execution.owner_user);
    state.authz.require(&identity, Permission::ExecutionCancel, Some(&scope)).await?;

    state
        .engine
        .clone()
        .cancel(
            id,
            &identity.user_id,
            request.reason.as_deref().unwrap_or("cancelled by operator"),
        )
        .await?;
    Ok(StatusCode::ACCEPTED)
}

/// Recovery status, retained from the startup pass.
pub async fn recovery_status(
    State(state): State<AppState>,
    Caller(identity): Caller,
) -> ApiResult<Json<serde_json::Value>> {
    state.authz.require(&identity, Permission::ExecutionView, None).await?;
    if state.recovery_in_progress.load(Ordering::SeqCst) {
        return Err(ApiError::service_unavailable("recovery in progress"));
    }
    let report = state.recovery_report.read().await;
    Ok(Json(match &*report {
        Some(report) => serde_json::to_value(report)
            .unwrap_or_else(|_| serde_json::json!({"status": "unserializable"})),
        None => serde_json::json!({"status": "never_run"}),
    }))
}

async fn load(state: &AppState, id: Uuid) -> Result<ProcessExecution, ApiError> {
    state
        .executions
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("execution {id} not found")))
}
