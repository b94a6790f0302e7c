//! Audit query endpoints (admin only).

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::auth::Caller;
use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::domain::models::{AuditEntry, AuditFilter, Permission};

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub actor: Option<String>,
    pub action: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct AuditPage {
    pub entries: Vec<AuditEntry>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

pub async fn list(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<AuditPage>> {
    state.authz.require(&identity, Permission::AdminViewAll, None).await?;

    let filter = AuditFilter {
        actor: query.actor,
        action: query.action,
        resource_type: query.resource_type,
        resource_id: query.resource_id,
        since: None,
        until: None,
    };
    let limit = query.limit.unwrap_or(100).min(1_000);
    let offset = query.offset.unwrap_or(0);
    let entries = state.audit.list(&filter, limit, offset).await?;
    let total = state.audit.count(&filter).await?;
    Ok(Json(AuditPage { entries, total, limit, offset }))
}

pub async fn get(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<AuditEntry>> {
    state.authz.require(&identity, Permission::AdminViewAll, None).await?;
    state
        .audit
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("audit entry {id} not found")))
}
