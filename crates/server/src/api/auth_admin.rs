use axum::Json;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;

use super::{AppState, clear_cookie, client_ip, session_cookie};
use crate::error::ServerError;

#[derive(Debug, Deserialize)]
pub struct StartBody {
    pub email: String,
}

/// `POST /auth/admin/start` -- begin the magic-link ceremony.
///
/// In dev-allow mode the response carries `login_url`; otherwise the link
/// is delivered by email only.
pub async fn start(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<StartBody>,
) -> Result<impl IntoResponse, ServerError> {
    let login_url = state
        .auth
        .admin_magic_start(&body.email, &client_ip(&headers))
        .await?;
    let body = match login_url {
        Some(url) => serde_json::json!({"status": "ok", "login_url": url}),
        None => serde_json::json!({"status": "ok"}),
    };
    Ok((StatusCode::OK, Json(body)))
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub token: String,
}

/// `GET /auth/admin/callback?token=...` -- consume the link and set the admin
/// session cookie.
pub async fn callback(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<CallbackQuery>,
) -> Result<impl IntoResponse, ServerError> {
    let (user, raw_session) = state.auth.admin_magic_callback(&query.token).await?;

    let jar = jar.add(session_cookie(
        &state.config.admin_session_cookie,
        raw_session,
        time::Duration::seconds(state.config.admin_session_ttl.as_secs() as i64),
        state.config.cookie_secure,
    ));
    Ok((
        jar,
        Json(serde_json::json!({
            "status": "ok",
            "user": {"id": user.id, "email": user.email},
        })),
    ))
}

/// `POST /auth/admin/logout` -- revoke and clear, idempotently.
pub async fn logout(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<impl IntoResponse, ServerError> {
    if let Some(cookie) = jar.get(&state.config.admin_session_cookie) {
        state.auth.admin_logout(cookie.value()).await?;
    }
    // Clear even when no valid session existed.
    let jar = jar.add(clear_cookie(
        &state.config.admin_session_cookie,
        state.config.cookie_secure,
    ));
    Ok((jar, StatusCode::NO_CONTENT))
}
