//! Schedule endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::auth::Caller;
use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::domain::models::{AuditEntry, Permission, Schedule};

#[derive(Debug, Deserialize)]
pub struct CreateScheduleRequest {
    pub process_name: String,
    pub cron: String,
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TriggerNowResponse {
    pub execution_id: Uuid,
}

pub async fn create(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Json(request): Json<CreateScheduleRequest>,
) -> ApiResult<(StatusCode, Json<Schedule>)> {
    state.authz.require(&identity, Permission::ScheduleManage, None).await?;

    let definition = state
        .definitions
        .latest_published(&request.process_name)
        .await?
        .ok_or_else(|| {
            ApiError::not_found(format!("published process {} not found", request.process_name))
        })?;

    let timezone = request.timezone.as_deref().unwrap_or("UTC");
    let schedule = state
        .scheduler
        .create(definition.id, &definition.name, &request.cron, timezone, &identity.user_id)
        .await?;
    state
        .audit
        .append(
            &AuditEntry::new(
                &identity.user_id,
                "schedule.create",
                "schedule",
                schedule.id.to_string(),
            )
            .with_details(serde_json::json!({
                "process": definition.name,
                "cron": schedule.cron,
                "timezone": schedule.timezone,
            })),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

pub async fn list(
    State(state): State<AppState>,
    Caller(identity): Caller,
) -> ApiResult<Json<Vec<Schedule>>> {
    state.authz.require(&identity, Permission::ScheduleView, None).await?;
    Ok(Json(state.schedule_repo.list().await?))
}

pub async fn enable(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Schedule>> {
    set_enabled(state, identity, id, true).await
}

pub async fn disable(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Schedule>> {
    set_enabled(state, identity, id, false).await
}

async fn set_enabled(
    state: AppState,
    identity: crate::domain::models::CallerIdentity,
    id: Uuid,
    enabled: bool,
) -> ApiResult<Json<Schedule>> {
    state.authz.require(&identity, Permission::ScheduleManage, None).await?;
    let schedule = state.scheduler.set_enabled(id, enabled).await?;
    state
        .audit
        .append(&AuditEntry::new(
            &identity.user_id,
            if enabled { "schedule.enable" } else { "schedule.disable" },
            "schedule",
            id.to_string(),
        ))
        .await?;
    Ok(Json(schedule))
}

pub async fn trigger(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<TriggerNowResponse>)> {
    state.authz.require(&identity, Permission::ScheduleManage, None).await?;
    let execution_id = state.scheduler.trigger_now(id, &identity.user_id).await?;
    state
        .audit
        .append(
            &AuditEntry::new(&identity.user_id, "schedule.trigger", "schedule", id.to_string())
                .with_details(serde_json::json!({ "execution_id": execution_id })),
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(TriggerNowResponse { execution_id })))
}
