use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;

use latchflow_core::{ApiToken, TokenId};

use super::{AppState, client_ip};
use crate::auth::service::DevicePollOutcome;
use crate::error::ServerError;

#[derive(Debug, Deserialize)]
pub struct DeviceStartBody {
    pub email: String,
    pub device_name: Option<String>,
}

/// `POST /auth/cli/device/start` -- begin the device-code ceremony.
pub async fn device_start(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<DeviceStartBody>,
) -> Result<impl IntoResponse, ServerError> {
    let start = state
        .auth
        .device_start(&body.email, body.device_name, &client_ip(&headers))
        .await?;
    Ok((StatusCode::OK, Json(start)))
}

#[derive(Debug, Deserialize)]
pub struct ApproveBody {
    pub user_code: String,
}

/// `POST /auth/cli/device/approve` -- an authenticated admin approves the
/// user code, minting the API token.
pub async fn device_approve(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<ApproveBody>,
) -> Result<StatusCode, ServerError> {
    let actor = state
        .authorize(&headers, &jar, "POST /auth/cli/device/approve", &[])
        .await?;
    state.auth.device_approve(&body.user_code, &actor.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct PollBody {
    pub device_code: String,
}

/// `POST /auth/cli/device/poll` -- `202` until approved, then `200` with
/// the raw token exactly once.
pub async fn device_poll(
    State(state): State<AppState>,
    Json(body): Json<PollBody>,
) -> Result<impl IntoResponse, ServerError> {
    match state.auth.device_poll(&body.device_code).await? {
        DevicePollOutcome::Pending => Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"status": "pending"})),
        )),
        DevicePollOutcome::Issued { access_token } => Ok((
            StatusCode::OK,
            Json(serde_json::json!({
                "access_token": access_token,
                "token_type": "bearer",
            })),
        )),
    }
}

fn token_view(token: &ApiToken) -> serde_json::Value {
    serde_json::json!({
        "id": token.id,
        "name": token.name,
        "scopes": token.scopes,
        "created_at": token.created_at,
        "expires_at": token.expires_at,
        "revoked_at": token.revoked_at,
        "last_used_at": token.last_used_at,
    })
}

/// `GET /auth/cli/tokens` -- the caller's tokens, hashes never included.
pub async fn list_tokens(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<impl IntoResponse, ServerError> {
    let actor = state
        .authorize(&headers, &jar, "GET /auth/cli/tokens", &["core:read"])
        .await?;
    let tokens = state.auth.list_tokens(&actor.user_id).await?;
    let views: Vec<_> = tokens.iter().map(token_view).collect();
    Ok(Json(serde_json::json!({"tokens": views})))
}

/// `POST /auth/cli/tokens` -- same listing for clients that can't GET with
/// a body-bearing middleware chain.
pub async fn list_tokens_post(
    state: State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<impl IntoResponse, ServerError> {
    list_tokens(state, headers, jar).await
}

#[derive(Debug, Deserialize)]
pub struct TokenRefBody {
    pub token_id: String,
}

/// `POST /auth/cli/tokens/revoke` -- revoke an owned token.
pub async fn revoke_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<TokenRefBody>,
) -> Result<StatusCode, ServerError> {
    let actor = state
        .authorize(&headers, &jar, "POST /auth/cli/tokens/revoke", &["core:write"])
        .await?;
    state
        .auth
        .revoke_token(&TokenId::new(body.token_id), &actor.user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /auth/cli/tokens/rotate` -- fresh secret for an owned token;
/// returns the raw value once.
pub async fn rotate_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<TokenRefBody>,
) -> Result<impl IntoResponse, ServerError> {
    let actor = state
        .authorize(&headers, &jar, "POST /auth/cli/tokens/rotate", &["core:write"])
        .await?;
    let raw = state
        .auth
        .rotate_token(&TokenId::new(body.token_id), &actor.user_id)
        .await?;
    Ok(Json(serde_json::json!({"access_token": raw, "token_type": "bearer"})))
}
