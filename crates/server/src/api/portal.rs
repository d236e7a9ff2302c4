//! The recipient portal: session-gated reads plus the guarded download.

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, header};
use axum::response::IntoResponse;
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;

use latchflow_core::{BundleId, Recipient};

use super::{AppState, client_ip, user_agent};
use crate::error::ServerError;

async fn require_recipient(
    state: &AppState,
    jar: &CookieJar,
) -> Result<Recipient, ServerError> {
    let raw = jar
        .get(&state.config.recipient_session_cookie)
        .map(|c| c.value().to_owned())
        .ok_or_else(|| ServerError::unauthorized("recipient session required"))?;
    let (_session, recipient) = state.auth.validate_recipient_session(&raw).await?;
    Ok(recipient)
}

/// `GET /portal/me`
pub async fn me(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<impl IntoResponse, ServerError> {
    let recipient = require_recipient(&state, &jar).await?;
    Ok(Json(serde_json::json!({
        "recipient": {
            "id": recipient.id,
            "email": recipient.email,
            "name": recipient.name,
        }
    })))
}

/// `GET /portal/assignments` -- the caller's usable assignments.
pub async fn list_assignments(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<impl IntoResponse, ServerError> {
    let recipient = require_recipient(&state, &jar).await?;
    let assignments: Vec<_> = state
        .store
        .assignments_for_recipient(&recipient.id)
        .await?
        .into_iter()
        .filter(|a| a.is_enabled && a.verification_met)
        .collect();
    Ok(Json(serde_json::json!({"assignments": assignments})))
}

/// `GET /portal/bundles` -- downloadable bundles with their limits.
pub async fn list_bundles(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<impl IntoResponse, ServerError> {
    let recipient = require_recipient(&state, &jar).await?;
    let assignments = state.store.assignments_for_recipient(&recipient.id).await?;

    let mut bundles = Vec::new();
    for assignment in assignments
        .into_iter()
        .filter(|a| a.is_enabled && a.verification_met)
    {
        let Some(bundle) = state.store.bundle(&assignment.bundle_id).await? else {
            continue;
        };
        if !bundle.is_enabled {
            continue;
        }
        let used = state.store.download_events(&assignment.id).await?.len();
        bundles.push(serde_json::json!({
            "bundle": {
                "id": bundle.id,
                "name": bundle.name,
                "description": bundle.description,
                "downloadable": bundle.has_archive(),
            },
            "assignment": {
                "id": assignment.id,
                "max_downloads": assignment.max_downloads,
                "cooldown_seconds": assignment.cooldown_seconds,
                "downloads_used": used,
                "last_download_at": assignment.last_download_at,
            },
        }));
    }
    Ok(Json(serde_json::json!({"bundles": bundles})))
}

/// `GET /portal/bundles/{bundleId}/objects` -- file listing of a granted
/// bundle.
pub async fn bundle_objects(
    State(state): State<AppState>,
    jar: CookieJar,
    Path(bundle_id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    let recipient = require_recipient(&state, &jar).await?;
    let id = BundleId::new(bundle_id);
    state
        .store
        .assignment_for(&id, &recipient.id)
        .await?
        .filter(|a| a.is_enabled && a.verification_met)
        .ok_or_else(|| ServerError::forbidden("assignment does not grant access"))?;

    let objects = state.store.enabled_bundle_objects_with_files(&id).await?;
    let listing: Vec<_> = objects
        .iter()
        .map(|(object, file)| {
            serde_json::json!({
                "key": file.key,
                "size": file.size,
                "content_type": file.content_type,
                "sort_order": object.sort_order,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({"objects": listing})))
}

/// `GET /portal/bundles/{bundleId}` -- the guarded, streaming download.
///
/// Quota and cooldown enforcement happens inside the download guard's
/// transaction. Only after the admission commits is the archive pointer
/// resolved and streamed; a digest-drift check runs after dispatch and
/// lazily schedules a rebuild.
pub async fn download(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(bundle_id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    let recipient = require_recipient(&state, &jar).await?;
    let id = BundleId::new(bundle_id);
    let assignment = state
        .store
        .assignment_for(&id, &recipient.id)
        .await?
        .filter(|a| a.verification_met)
        .ok_or_else(|| ServerError::forbidden("assignment does not grant access"))?;

    let admitted = state
        .guard
        .authorize(
            &assignment.id,
            Utc::now(),
            &client_ip(&headers),
            &user_agent(&headers),
        )
        .await?;

    let etag = match state.storage.head_file(&admitted.bundle.storage_path).await {
        Ok(head) => head.etag.unwrap_or_else(|| admitted.bundle.checksum.clone()),
        Err(_) => admitted.bundle.checksum.clone(),
    };
    let stream = state
        .storage
        .get_file_stream(&admitted.bundle.storage_path, None)
        .await?;

    // Lazy self-heal: recompute the digest off the request path.
    let guard = state.guard.clone();
    let drift_id = id.clone();
    tokio::spawn(async move {
        guard.verify_digest(&drift_id).await;
    });

    let filename = format!("{}.zip", admitted.bundle.name.replace(['/', '\\', '"'], "_"));
    let response = axum::response::Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::ETAG, etag)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        )
        .body(Body::from_stream(stream))
        .map_err(|e| ServerError::internal(e.to_string()))?;
    Ok(response)
}
