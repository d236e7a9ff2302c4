use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;
use serde::Deserialize;

use latchflow_core::{
    ActorRef, Bundle, BundleAssignment, BundleId, BundleObject, RecipientId,
};

use super::AppState;
use crate::error::ServerError;

const READ: &[&str] = &["bundles:read"];
const WRITE: &[&str] = &["bundles:write"];

#[derive(Debug, Deserialize)]
pub struct CreateBody {
    pub name: String,
    pub description: Option<String>,
}

/// `GET /bundles`
pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<impl IntoResponse, ServerError> {
    state.authorize(&headers, &jar, "GET /bundles", READ).await?;
    let bundles = state.store.list_bundles().await?;
    Ok(Json(serde_json::json!({"bundles": bundles})))
}

/// `POST /bundles`
pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<CreateBody>,
) -> Result<impl IntoResponse, ServerError> {
    let actor = state.authorize(&headers, &jar, "POST /bundles", WRITE).await?;
    if body.name.trim().is_empty() {
        return Err(ServerError::bad_request("name is required"));
    }
    let now = Utc::now();
    let bundle = Bundle {
        id: BundleId::generate(),
        name: body.name,
        description: body.description,
        storage_path: String::new(),
        checksum: String::new(),
        bundle_digest: String::new(),
        is_enabled: true,
        created_at: now,
        updated_at: now,
    };
    state
        .store
        .create_bundle(bundle.clone(), &ActorRef::user(actor.user_id))
        .await?;
    Ok((StatusCode::CREATED, Json(bundle)))
}

/// `GET /bundles/{bundleId}` -- the bundle with its objects.
pub async fn get_one(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(bundle_id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    state
        .authorize(&headers, &jar, "GET /bundles/:bundleId", READ)
        .await?;
    let id = BundleId::new(bundle_id);
    let bundle = state
        .store
        .bundle(&id)
        .await?
        .ok_or_else(|| ServerError::not_found("bundle not found"))?;
    let objects = state.store.bundle_objects(&id).await?;
    Ok(Json(serde_json::json!({"bundle": bundle, "objects": objects})))
}

#[derive(Debug, Deserialize)]
pub struct UpdateBody {
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_enabled: Option<bool>,
}

/// `PATCH /bundles/{bundleId}`
pub async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(bundle_id): Path<String>,
    Json(body): Json<UpdateBody>,
) -> Result<impl IntoResponse, ServerError> {
    let actor = state
        .authorize(&headers, &jar, "PATCH /bundles/:bundleId", WRITE)
        .await?;
    let id = BundleId::new(bundle_id);
    let mut bundle = state
        .store
        .bundle(&id)
        .await?
        .ok_or_else(|| ServerError::not_found("bundle not found"))?;
    if let Some(name) = body.name {
        bundle.name = name;
    }
    if let Some(description) = body.description {
        bundle.description = Some(description);
    }
    if let Some(enabled) = body.is_enabled {
        bundle.is_enabled = enabled;
    }
    bundle.updated_at = Utc::now();
    state
        .store
        .update_bundle(bundle.clone(), &ActorRef::user(actor.user_id))
        .await?;
    Ok(Json(bundle))
}

/// `DELETE /bundles/{bundleId}` -- refuses while objects or assignments
/// exist.
pub async fn remove(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(bundle_id): Path<String>,
) -> Result<StatusCode, ServerError> {
    state
        .authorize(&headers, &jar, "DELETE /bundles/:bundleId", WRITE)
        .await?;
    state.store.delete_bundle(&BundleId::new(bundle_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct AddObjectBody {
    pub file_id: String,
    pub sort_order: i32,
    #[serde(default)]
    pub required: bool,
}

/// `POST /bundles/{bundleId}/objects` -- attach a file; schedules a
/// rebuild.
pub async fn add_object(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(bundle_id): Path<String>,
    Json(body): Json<AddObjectBody>,
) -> Result<impl IntoResponse, ServerError> {
    let actor = state
        .authorize(&headers, &jar, "POST /bundles/:bundleId/objects", WRITE)
        .await?;
    let id = BundleId::new(bundle_id);
    let object = BundleObject {
        id: uuid::Uuid::new_v4().to_string(),
        bundle_id: id.clone(),
        file_id: body.file_id.into(),
        sort_order: body.sort_order,
        required: body.required,
        is_enabled: true,
    };
    state
        .store
        .add_bundle_object(object.clone(), &ActorRef::user(actor.user_id))
        .await?;
    state.scheduler.schedule(&id, false);
    Ok((StatusCode::CREATED, Json(object)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateObjectBody {
    pub is_enabled: Option<bool>,
    pub sort_order: Option<i32>,
    pub required: Option<bool>,
}

/// `POST /bundles/{bundleId}/objects/{objectId}` -- toggle/reorder an
/// object; schedules a rebuild.
pub async fn update_object(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path((bundle_id, object_id)): Path<(String, String)>,
    Json(body): Json<UpdateObjectBody>,
) -> Result<impl IntoResponse, ServerError> {
    let actor = state
        .authorize(&headers, &jar, "POST /bundles/:bundleId/objects/:id", WRITE)
        .await?;
    let id = BundleId::new(bundle_id);
    let mut object = state
        .store
        .bundle_objects(&id)
        .await?
        .into_iter()
        .find(|o| o.id == object_id)
        .ok_or_else(|| ServerError::not_found("bundle object not found"))?;
    if let Some(enabled) = body.is_enabled {
        object.is_enabled = enabled;
    }
    if let Some(sort_order) = body.sort_order {
        object.sort_order = sort_order;
    }
    if let Some(required) = body.required {
        object.required = required;
    }
    state
        .store
        .update_bundle_object(object.clone(), &ActorRef::user(actor.user_id))
        .await?;
    state.scheduler.schedule(&id, false);
    Ok(Json(object))
}

/// `GET /bundles/{bundleId}/versions` -- change-log rows without their
/// payloads.
pub async fn versions(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(bundle_id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    state
        .authorize(&headers, &jar, "GET /bundles/:bundleId/versions", READ)
        .await?;
    let rows = state.store.history("bundle", &bundle_id).await?;
    let views: Vec<_> = rows
        .iter()
        .map(|r| {
            serde_json::json!({
                "version": r.version,
                "is_snapshot": r.is_snapshot,
                "hash": r.hash,
                "change_note": r.change_note,
                "changed_path": r.changed_path,
                "change_kind": r.change_kind,
                "created_at": r.created_at,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({"versions": views})))
}

/// `GET /bundles/{bundleId}/versions/{version}` -- materialized state at a
/// version.
pub async fn version_at(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path((bundle_id, version)): Path<(String, u64)>,
) -> Result<impl IntoResponse, ServerError> {
    state
        .authorize(&headers, &jar, "GET /bundles/:bundleId/versions/:version", READ)
        .await?;
    let materialized = state.store.materialize("bundle", &bundle_id, version).await?;
    Ok(Json(serde_json::json!({
        "version": version,
        "state": materialized,
    })))
}

#[derive(Debug, Deserialize)]
pub struct BuildBody {
    #[serde(default)]
    pub force: bool,
}

/// `POST /admin/bundles/{bundleId}/build` -- request a rebuild.
pub async fn build(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(bundle_id): Path<String>,
    body: Option<Json<BuildBody>>,
) -> Result<impl IntoResponse, ServerError> {
    state
        .authorize(&headers, &jar, "POST /admin/bundles/:bundleId/build", WRITE)
        .await?;
    let force = body.map(|Json(b)| b.force).unwrap_or(false);
    let id = BundleId::new(bundle_id);
    if state.store.bundle(&id).await?.is_none() {
        return Err(ServerError::not_found("bundle not found"));
    }
    state.scheduler.schedule(&id, force);
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"status": "scheduled"})),
    ))
}

/// `GET /admin/bundles/{bundleId}/build/status`
pub async fn build_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(bundle_id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    state
        .authorize(&headers, &jar, "GET /admin/bundles/:bundleId/build/status", READ)
        .await?;
    Ok(Json(state.scheduler.get_status(&BundleId::new(bundle_id))))
}

#[derive(Debug, Deserialize)]
pub struct AssignBody {
    pub recipient_id: String,
    pub max_downloads: Option<u32>,
    pub cooldown_seconds: Option<u32>,
    #[serde(default = "default_true")]
    pub verification_met: bool,
}

fn default_true() -> bool {
    true
}

async fn create_assignment(
    state: &AppState,
    bundle_id: &BundleId,
    body: AssignBody,
) -> Result<BundleAssignment, ServerError> {
    if state.store.bundle(bundle_id).await?.is_none() {
        return Err(ServerError::not_found("bundle not found"));
    }
    let recipient_id = RecipientId::new(body.recipient_id);
    if state.store.recipient(&recipient_id).await?.is_none() {
        return Err(ServerError::not_found("recipient not found"));
    }
    let assignment = BundleAssignment {
        id: uuid::Uuid::new_v4().to_string().into(),
        bundle_id: bundle_id.clone(),
        recipient_id,
        is_enabled: true,
        max_downloads: body.max_downloads,
        cooldown_seconds: body.cooldown_seconds,
        last_download_at: None,
        verification_met: body.verification_met,
        created_at: Utc::now(),
    };
    state.store.create_assignment(assignment.clone()).await?;
    Ok(assignment)
}

/// `POST /bundles/{bundleId}/recipients` -- grant one recipient access.
pub async fn assign_recipient(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(bundle_id): Path<String>,
    Json(body): Json<AssignBody>,
) -> Result<impl IntoResponse, ServerError> {
    state
        .authorize(&headers, &jar, "POST /bundles/:bundleId/recipients", WRITE)
        .await?;
    let assignment = create_assignment(&state, &BundleId::new(bundle_id), body).await?;
    Ok((StatusCode::CREATED, Json(assignment)))
}

#[derive(Debug, Deserialize)]
pub struct AssignBatchBody {
    pub assignments: Vec<AssignBody>,
}

/// `POST /bundles/{bundleId}/recipients/batch` -- per-item results; one
/// failure does not abort the rest.
pub async fn assign_recipients_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(bundle_id): Path<String>,
    Json(body): Json<AssignBatchBody>,
) -> Result<impl IntoResponse, ServerError> {
    state
        .authorize(&headers, &jar, "POST /bundles/:bundleId/recipients/batch", WRITE)
        .await?;
    let id = BundleId::new(bundle_id);
    let mut results = Vec::with_capacity(body.assignments.len());
    for item in body.assignments {
        match create_assignment(&state, &id, item).await {
            Ok(assignment) => results.push(serde_json::json!({"assignment": assignment})),
            Err(e) => results.push(serde_json::json!({
                "status": "error",
                "code": e.code,
                "message": e.message,
            })),
        }
    }
    Ok(Json(serde_json::json!({"results": results})))
}

#[derive(Debug, Deserialize)]
pub struct UnassignQuery {
    #[serde(rename = "recipientId")]
    pub recipient_id: String,
}

/// `DELETE /bundles/{bundleId}/recipients?recipientId=...`
pub async fn unassign_recipient(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(bundle_id): Path<String>,
    Query(query): Query<UnassignQuery>,
) -> Result<StatusCode, ServerError> {
    state
        .authorize(&headers, &jar, "DELETE /bundles/:bundleId/recipients", WRITE)
        .await?;
    let assignment = state
        .store
        .assignment_for(
            &BundleId::new(bundle_id),
            &RecipientId::new(query.recipient_id),
        )
        .await?
        .ok_or_else(|| ServerError::not_found("assignment not found"))?;
    state.store.delete_assignment(&assignment.id).await?;
    Ok(StatusCode::NO_CONTENT)
}
