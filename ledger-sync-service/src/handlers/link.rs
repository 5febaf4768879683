use crate::dtos::{ExchangeTokenRequest, ExchangeTokenResponse, LinkTokenResponse};
use crate::middleware::user_id::UserId;
use crate::services::LedgerStore;
use crate::startup::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use service_core::error::AppError;

#[tracing::instrument(skip(state), fields(user_id = user_id.0))]
pub async fn create_link_token(
    State(state): State<AppState>,
    user_id: UserId,
) -> Result<Json<LinkTokenResponse>, AppError> {
    let link_token = state.provider.create_link_token(user_id.0).await?;
    Ok(Json(LinkTokenResponse { link_token }))
}

/// Trade the public token from the link flow for a credential, store it as
/// a new connection with an empty cursor and start syncing it.
#[tracing::instrument(skip(state, request), fields(user_id = user_id.0))]
pub async fn exchange_public_token(
    State(state): State<AppState>,
    user_id: UserId,
    Json(request): Json<ExchangeTokenRequest>,
) -> Result<impl IntoResponse, AppError> {
    let public_token = request.public_token.trim();
    if public_token.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "public_token is required"
        )));
    }

    if state.db.get_user(user_id.0).await?.is_none() {
        return Err(AppError::NotFound(anyhow::anyhow!(
            "User {} not found",
            user_id.0
        )));
    }

    let access_token = state.provider.exchange_public_token(public_token).await?;
    let connection = state
        .db
        .create_connection(user_id.0, &access_token)
        .await?;

    let scheduled = state.scheduler.watch(connection.id);
    tracing::info!(
        connection_id = connection.id,
        scheduled,
        "Connection created from public token"
    );

    Ok((
        StatusCode::CREATED,
        Json(ExchangeTokenResponse {
            connection_id: connection.id,
        }),
    ))
}
