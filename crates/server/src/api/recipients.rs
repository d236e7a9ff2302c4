use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;
use serde::Deserialize;

use latchflow_core::{ActorRef, Recipient, RecipientId};

use super::AppState;
use crate::error::ServerError;

const READ: &[&str] = &["recipients:read"];
const WRITE: &[&str] = &["recipients:write"];

/// `GET /recipients`
pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<impl IntoResponse, ServerError> {
    state.authorize(&headers, &jar, "GET /recipients", READ).await?;
    let recipients = state.store.list_recipients().await?;
    Ok(Json(serde_json::json!({"recipients": recipients})))
}

#[derive(Debug, Deserialize)]
pub struct CreateBody {
    pub email: String,
    pub name: Option<String>,
}

/// `POST /recipients`
pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<CreateBody>,
) -> Result<impl IntoResponse, ServerError> {
    let actor = state.authorize(&headers, &jar, "POST /recipients", WRITE).await?;
    if !body.email.contains('@') {
        return Err(ServerError::bad_request("invalid email"));
    }
    let recipient = Recipient {
        id: RecipientId::generate(),
        email: body.email.to_lowercase(),
        name: body.name,
        is_enabled: true,
        created_at: Utc::now(),
    };
    state
        .store
        .create_recipient(recipient.clone(), &ActorRef::user(actor.user_id))
        .await?;
    Ok((StatusCode::CREATED, Json(recipient)))
}

/// `GET /recipients/{recipientId}`
pub async fn get_one(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(recipient_id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    state
        .authorize(&headers, &jar, "GET /recipients/:recipientId", READ)
        .await?;
    let recipient = state
        .store
        .recipient(&RecipientId::new(recipient_id))
        .await?
        .ok_or_else(|| ServerError::not_found("recipient not found"))?;
    Ok(Json(recipient))
}

#[derive(Debug, Deserialize)]
pub struct UpdateBody {
    pub email: Option<String>,
    pub name: Option<String>,
    pub is_enabled: Option<bool>,
}

/// `PATCH /recipients/{recipientId}`
pub async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(recipient_id): Path<String>,
    Json(body): Json<UpdateBody>,
) -> Result<impl IntoResponse, ServerError> {
    let actor = state
        .authorize(&headers, &jar, "PATCH /recipients/:recipientId", WRITE)
        .await?;
    let id = RecipientId::new(recipient_id);
    let mut recipient = state
        .store
        .recipient(&id)
        .await?
        .ok_or_else(|| ServerError::not_found("recipient not found"))?;
    if let Some(email) = body.email {
        if !email.contains('@') {
            return Err(ServerError::bad_request("invalid email"));
        }
        recipient.email = email.to_lowercase();
    }
    if let Some(name) = body.name {
        recipient.name = Some(name);
    }
    if let Some(enabled) = body.is_enabled {
        recipient.is_enabled = enabled;
    }
    state
        .store
        .update_recipient(recipient.clone(), &ActorRef::user(actor.user_id))
        .await?;
    Ok(Json(recipient))
}

/// `DELETE /recipients/{recipientId}` -- refuses while assignments exist.
pub async fn remove(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(recipient_id): Path<String>,
) -> Result<StatusCode, ServerError> {
    state
        .authorize(&headers, &jar, "DELETE /recipients/:recipientId", WRITE)
        .await?;
    state
        .store
        .delete_recipient(&RecipientId::new(recipient_id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
