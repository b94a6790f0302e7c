//! Router assembly and server entry.

use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::atomic::Ordering;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use super::state::AppState;
use super::{approvals, audit, executions, processes, schedules, ws};
use crate::infrastructure::config::ServerConfig;

/// Build the full router.
pub fn build_router(state: AppState, enable_cors: bool) -> Router {
    let mut router = Router::new()
        .route("/processes", post(processes::create).get(processes::list))
        .route(
            "/processes/{id}",
            get(processes::get).put(processes::update).delete(processes::delete),
        )
        .route("/processes/{id}/publish", post(processes::publish))
        .route("/processes/{id}/archive", post(processes::archive))
        .route("/executions", post(executions::trigger).get(executions::list))
        .route("/executions/recovery/status", get(executions::recovery_status))
        .route("/executions/{id}", get(executions::get))
        .route("/executions/{id}/cancel", post(executions::cancel))
        .route("/approvals/{approval_id}/decide", post(approvals::decide))
        .route("/schedules", post(schedules::create).get(schedules::list))
        .route("/schedules/{id}/enable", post(schedules::enable))
        .route("/schedules/{id}/disable", post(schedules::disable))
        .route("/schedules/{id}/trigger", post(schedules::trigger))
        .route("/audit", get(audit::list))
        .route("/audit/{id}", get(audit::get))
        .route("/webhooks/{process_name}", post(executions::webhook_trigger))
        .route("/ws/events", get(ws::events))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if enable_cors {
        router = router.layer(
            CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any),
        );
    }
    router
}

/// Serve until the process is told to stop.
pub async fn serve(config: &ServerConfig, state: AppState) -> anyhow::Result<()> {
    let router = build_router(state, config.enable_cors);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "http server listening");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn health(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<Json<serde_json::Value>, super::error::ApiError> {
    if state.recovery_in_progress.load(Ordering::SeqCst) {
        return Err(super::error::ApiError::service_unavailable("recovery in progress"));
    }
    let report = state.recovery_report.read().await;
    let recovery = report.as_ref().map(|r| {
        serde_json::json!({
            "resumed": r.resumed,
            "retried": r.retried,
            "failed": r.failed,
            "errors": r.errors.len(),
        })
    });
    Ok(Json(serde_json::json!({
        "status": "ok",
        "recovery": recovery,
        "ws_subscribers": state.bus.subscriber_count(),
    })))
}
