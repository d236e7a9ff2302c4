use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;

use super::{AppState, clear_cookie, client_ip, session_cookie};
use crate::error::ServerError;

/// Identity field accepted by the recipient ceremonies: an email or a
/// recipient id.
#[derive(Debug, Deserialize)]
pub struct IdentityBody {
    pub email: Option<String>,
    pub recipient_id: Option<String>,
}

impl IdentityBody {
    fn identity(&self) -> Result<&str, ServerError> {
        self.email
            .as_deref()
            .or(self.recipient_id.as_deref())
            .ok_or_else(|| ServerError::bad_request("email or recipient_id required"))
    }
}

/// `POST /auth/recipient/start` -- issue an OTP. Responds 204 whether or
/// not the recipient exists.
pub async fn start(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<IdentityBody>,
) -> Result<StatusCode, ServerError> {
    state
        .auth
        .recipient_otp_start(body.identity()?, &client_ip(&headers))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /portal/auth/otp/resend` -- fresh OTP, always 204.
pub async fn resend(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<IdentityBody>,
) -> Result<StatusCode, ServerError> {
    state
        .auth
        .recipient_otp_start(body.identity()?, &client_ip(&headers))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct VerifyBody {
    pub email: Option<String>,
    pub recipient_id: Option<String>,
    pub otp: String,
}

/// `POST /auth/recipient/verify` -- check the OTP and set the recipient
/// session cookie.
pub async fn verify(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<VerifyBody>,
) -> Result<impl IntoResponse, ServerError> {
    let identity = body
        .email
        .as_deref()
        .or(body.recipient_id.as_deref())
        .ok_or_else(|| ServerError::bad_request("email or recipient_id required"))?;

    let (recipient, raw_session) = state
        .auth
        .recipient_otp_verify(identity, &body.otp, &client_ip(&headers))
        .await?;

    let jar = jar.add(session_cookie(
        &state.config.recipient_session_cookie,
        raw_session,
        time::Duration::seconds(state.config.recipient_session_ttl.as_secs() as i64),
        state.config.cookie_secure,
    ));
    Ok((
        jar,
        Json(serde_json::json!({
            "status": "ok",
            "recipient": {"id": recipient.id, "email": recipient.email},
        })),
    ))
}

/// `POST /auth/recipient/logout` -- revoke and clear, idempotently.
pub async fn logout(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<impl IntoResponse, ServerError> {
    if let Some(cookie) = jar.get(&state.config.recipient_session_cookie) {
        state.auth.recipient_logout(cookie.value()).await?;
    }
    let jar = jar.add(clear_cookie(
        &state.config.recipient_session_cookie,
        state.config.cookie_secure,
    ));
    Ok((jar, StatusCode::NO_CONTENT))
}
