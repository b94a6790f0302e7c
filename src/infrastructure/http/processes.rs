//! Process definition endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use super::auth::Caller;
use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::domain::errors::{EngineError, ErrorKind};
use crate::domain::models::{
    AuditEntry, DataClassification, DefinitionStatus, OutputConfig, Permission, ProcessDefinition,
    QueuePriority, StepDefinition, TriggerSpec,
};
use crate::services::authorization::AuthScope;

#[derive(Debug, Deserialize)]
pub struct CreateProcessRequest {
    pub name: String,
    #[serde(default)]
    pub owner_team: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub triggers: Option<Vec<TriggerSpec>>,
    #[serde(default)]
    pub output: Option<OutputConfig>,
    #[serde(default)]
    pub max_concurrent_instances: Option<u32>,
    #[serde(default)]
    pub priority: Option<QueuePriority>,
    #[serde(default)]
    pub max_cost: Option<f64>,
    #[serde(default)]
    pub data_classification: Option<DataClassification>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProcessRequest {
    #[serde(default)]
    pub steps: Option<Vec<StepDefinition>>,
    #[serde(default)]
    pub triggers: Option<Vec<TriggerSpec>>,
    #[serde(default)]
    pub output: Option<OutputConfig>,
    #[serde(default)]
    pub max_concurrent_instances: Option<u32>,
    #[serde(default)]
    pub max_cost: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct ListProcessesQuery {
    pub status: Option<String>,
}

pub async fn create(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Json(request): Json<CreateProcessRequest>,
) -> ApiResult<(StatusCode, Json<ProcessDefinition>)> {
    state.authz.require(&identity, Permission::ProcessCreate, None).await?;

    if request.name.trim().is_empty() {
        return Err(ApiError::bad_request("process name cannot be empty"));
    }

    let owner_team = request.owner_team.unwrap_or_else(|| identity.team.clone());
    let mut definition = ProcessDefinition::new_draft(&request.name, owner_team, &identity.user_id);
    definition.steps = request.steps;
    if let Some(triggers) = request.triggers {
        definition.triggers = triggers;
    }
    definition.output = request.output;
    definition.max_concurrent_instances = request.max_concurrent_instances;
    definition.priority = request.priority.unwrap_or_default();
    definition.max_cost = request.max_cost;
    definition.data_classification = request.data_classification.unwrap_or_default();

    // A new name starts at 1.0; a known name gets the next draft version.
    if let Some(existing) = state.definitions.get_by_name(&request.name, None).await? {
        definition.version = existing.version.next_minor();
    }

    state.definitions.save(&definition).await?;
    state
        .audit
        .append(
            &AuditEntry::new(&identity.user_id, "process.create", "process", definition.id.to_string())
                .with_details(serde_json::json!({
                    "name": definition.name,
                    "version": definition.version.to_string(),
                }))
                .with_classification(definition.data_classification),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(definition)))
}

pub async fn update(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateProcessRequest>,
) -> ApiResult<Json<ProcessDefinition>> {
    let mut definition = load(&state, id).await?;
    let scope = AuthScope::process(id.to_string(), &definition.owner_team);
    state.authz.require(&identity, Permission::ProcessUpdate, Some(&scope)).await?;

    if let Some(steps) = request.steps {
        definition.set_steps(steps)?;
    }
    if definition.status != DefinitionStatus::Draft {
        return Err(EngineError::StateConflict(format!(
            "definition {} is {}, only drafts can be edited",
            definition.name,
            definition.status.as_str()
        ))
        .into());
    }
    if let Some(triggers) = request.triggers {
        definition.triggers = triggers;
    }
    if request.output.is_some() {
        definition.output = request.output;
    }
    if request.max_concurrent_instances.is_some() {
        definition.max_concurrent_instances = request.max_concurrent_instances;
    }
    if request.max_cost.is_some() {
        definition.max_cost = request.max_cost;
    }

    state.definitions.save(&definition).await?;
    state
        .audit
        .append(&AuditEntry::new(
            &identity.user_id,
            "process.update",
            "process",
            id.to_string(),
        ))
        .await?;
    Ok(Json(definition))
}

pub async fn publish(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ProcessDefinition>> {
    let mut definition = load(&state, id).await?;
    let scope = AuthScope::process(id.to_string(), &definition.owner_team);
    state.authz.require(&identity, Permission::ProcessPublish, Some(&scope)).await?;

    definition.publish().map_err(|e| match e.kind() {
        // Structural problems in the DAG are 422, not a plain bad request.
        ErrorKind::Validation => ApiError::unprocessable(e.to_string()),
        _ => e.into(),
    })?;
    state.definitions.save(&definition).await?;
    state
        .audit
        .append(
            &AuditEntry::new(&identity.user_id, "process.publish", "process", id.to_string())
                .with_details(serde_json::json!({
                    "name": definition.name,
                    "version": definition.version.to_string(),
                })),
        )
        .await?;
    Ok(Json(definition))
}

pub async fn archive(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ProcessDefinition>> {
    let mut definition = load(&state, id).await?;
    let scope = AuthScope::process(id.to_string(), &definition.owner_team);
    state.authz.require(&identity, Permission::ProcessDelete, Some(&scope)).await?;

    definition.archive()?;
    state.definitions.save(&definition).await?;
    state
        .audit
        .append(&AuditEntry::new(
            &identity.user_id,
            "process.archive",
            "process",
            id.to_string(),
        ))
        .await?;
    Ok(Json(definition))
}

pub async fn list(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Query(query): Query<ListProcessesQuery>,
) -> ApiResult<Json<Vec<ProcessDefinition>>> {
    state.authz.require(&identity, Permission::ProcessRead, None).await?;
    let status = match query.status.as_deref() {
        Some(s) => Some(
            DefinitionStatus::from_str(s)
                .ok_or_else(|| ApiError::bad_request(format!("unknown status '{s}'")))?,
        ),
        None => None,
    };
    Ok(Json(state.definitions.list(status).await?))
}

pub async fn get(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ProcessDefinition>> {
    state.authz.require(&identity, Permission::ProcessRead, None).await?;
    Ok(Json(load(&state, id).await?))
}

pub async fn delete(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let definition = load(&state, id).await?;
    let scope = AuthScope::process(id.to_string(), &definition.owner_team);
    state.authz.require(&identity, Permission::ProcessDelete, Some(&scope)).await?;

    if definition.status != DefinitionStatus::Draft {
        return Err(EngineError::StateConflict(format!(
            "only drafts can be deleted; {} is {}",
            definition.name,
            definition.status.as_str()
        ))
        .into());
    }
    state.definitions.delete(id).await?;
    state
        .audit
        .append(&AuditEntry::new(
            &identity.user_id,
            "process.delete",
            "process",
            id.to_string(),
        ))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn load(state: &AppState, id: Uuid) -> Result<ProcessDefinition, ApiError> {
    state
        .definitions
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("process {id} not found")))
}
