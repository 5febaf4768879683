use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;

/// UserId extractor for ledger-sync-service.
///
/// The session layer in front of this service authenticates the caller and
/// forwards the numeric user id in `X-User-ID`. Every connection lookup is
/// scoped to this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserId(pub i64);

#[async_trait]
impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get("X-User-ID")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::AuthError(anyhow::anyhow!("Missing X-User-ID header")))?;

        let user_id = raw.trim().parse::<i64>().map_err(|_| {
            AppError::BadRequest(anyhow::anyhow!("X-User-ID must be a numeric user id"))
        })?;

        tracing::Span::current().record("user_id", user_id);

        Ok(UserId(user_id))
    }
}
