use crate::dtos::{ConnectionListResponse, ConnectionResponse, TriggerSyncResponse};
use crate::middleware::user_id::UserId;
use crate::services::LedgerStore;
use crate::startup::AppState;
use crate::sync::TriggerOutcome;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;

pub async fn list_connections(
    State(state): State<AppState>,
    user_id: UserId,
) -> Result<Json<ConnectionListResponse>, AppError> {
    let connections = state
        .db
        .list_connections_for_user(user_id.0)
        .await?
        .into_iter()
        .map(|connection| {
            let running = state.scheduler.is_running(connection.id);
            ConnectionResponse::new(connection, running)
        })
        .collect();

    Ok(Json(ConnectionListResponse { connections }))
}

/// Start an on-demand pass. 202 when started, 409 when one is in flight.
#[tracing::instrument(skip(state), fields(user_id = user_id.0))]
pub async fn trigger_sync(
    State(state): State<AppState>,
    user_id: UserId,
    Path(connection_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    // Another user's connection is reported as missing.
    let owned = state
        .db
        .get_connection(connection_id)
        .await?
        .filter(|connection| connection.user_id == user_id.0);
    if owned.is_none() {
        return Err(AppError::NotFound(anyhow::anyhow!(
            "Connection {} not found",
            connection_id
        )));
    }

    match state.scheduler.trigger(connection_id) {
        TriggerOutcome::Started => Ok((
            StatusCode::ACCEPTED,
            Json(TriggerSyncResponse {
                connection_id,
                status: "started".to_string(),
            }),
        )),
        TriggerOutcome::AlreadyRunning => Err(AppError::Conflict(anyhow::anyhow!(
            "A sync is already running for connection {}",
            connection_id
        ))),
    }
}
