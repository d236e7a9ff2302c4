use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;
use serde::Deserialize;

use latchflow_core::{FileId, FileRecord};

use super::AppState;
use crate::error::ServerError;

const READ: &[&str] = &["files:read"];
const WRITE: &[&str] = &["files:write"];

/// `GET /files`
pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<impl IntoResponse, ServerError> {
    state.authorize(&headers, &jar, "GET /files", READ).await?;
    let files = state.store.list_files().await?;
    Ok(Json(serde_json::json!({"files": files})))
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub key: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// `POST /files/upload?key=...&content_type=...` -- direct body upload into
/// content-addressed storage plus a metadata row.
pub async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Query(query): Query<UploadQuery>,
    body: bytes::Bytes,
) -> Result<impl IntoResponse, ServerError> {
    state.authorize(&headers, &jar, "POST /files/upload", WRITE).await?;
    if query.key.trim().is_empty() {
        return Err(ServerError::bad_request("key is required"));
    }
    let content_type = query
        .content_type
        .unwrap_or_else(|| "application/octet-stream".to_owned());

    let put = state.storage.put_file(body, &content_type).await?;
    let now = Utc::now();
    let file = FileRecord {
        id: FileId::generate(),
        key: query.key,
        storage_key: put.storage_key,
        size: put.size,
        content_type,
        content_hash: put.sha256,
        etag: put.storage_etag,
        metadata: Default::default(),
        created_at: now,
        updated_at: now,
    };
    state.store.create_file(file.clone()).await?;
    Ok((StatusCode::CREATED, Json(file)))
}

#[derive(Debug, Deserialize)]
pub struct UploadUrlBody {
    pub key: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// `POST /files/upload-url` -- presign a direct upload; `501` when the
/// driver can't.
pub async fn upload_url(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<UploadUrlBody>,
) -> Result<impl IntoResponse, ServerError> {
    state.authorize(&headers, &jar, "POST /files/upload-url", WRITE).await?;
    if !state.storage.supports_signed_put() {
        return Err(ServerError::not_implemented(
            "storage driver does not support signed uploads",
        ));
    }
    let signed = state
        .storage
        .create_signed_put_url(
            &body.key,
            body.content_type.as_deref(),
            std::time::Duration::from_secs(15 * 60),
        )
        .await?;
    Ok(Json(serde_json::json!({
        "url": signed.url,
        "headers": signed.headers,
    })))
}

#[derive(Debug, Deserialize)]
pub struct CommitBody {
    pub key: String,
    /// Hex SHA-256 of the uploaded bytes; names the storage object.
    pub sha256: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// `POST /files/commit` -- register a presign-uploaded object as a file.
pub async fn commit(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<CommitBody>,
) -> Result<impl IntoResponse, ServerError> {
    state.authorize(&headers, &jar, "POST /files/commit", WRITE).await?;
    if body.sha256.len() != 64 || !body.sha256.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ServerError::bad_request("sha256 must be 64 hex chars"));
    }

    let storage_key = state.storage.derive_key(&body.sha256);
    let head = state.storage.head_file(&storage_key).await.map_err(|e| {
        match e {
            latchflow_storage::StorageError::NotFound(_) => {
                ServerError::not_found("uploaded object not found in storage")
            }
            other => other.into(),
        }
    })?;

    let now = Utc::now();
    let file = FileRecord {
        id: FileId::generate(),
        key: body.key,
        storage_key,
        size: head.size,
        content_type: body
            .content_type
            .or(head.content_type)
            .unwrap_or_else(|| "application/octet-stream".to_owned()),
        content_hash: body.sha256.to_lowercase(),
        etag: head.etag,
        metadata: Default::default(),
        created_at: now,
        updated_at: now,
    };
    state.store.create_file(file.clone()).await?;
    Ok((StatusCode::CREATED, Json(file)))
}

/// `GET /files/{fileId}`
pub async fn get_one(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(file_id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    state.authorize(&headers, &jar, "GET /files/:id", READ).await?;
    let file = state
        .store
        .file(&FileId::new(file_id))
        .await?
        .ok_or_else(|| ServerError::not_found("file not found"))?;
    Ok(Json(file))
}

/// `DELETE /files/{fileId}` -- refuses while bundled.
pub async fn remove(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(file_id): Path<String>,
) -> Result<StatusCode, ServerError> {
    state.authorize(&headers, &jar, "DELETE /files/:id", WRITE).await?;
    let id = FileId::new(file_id);
    let file = state
        .store
        .file(&id)
        .await?
        .ok_or_else(|| ServerError::not_found("file not found"))?;
    state.store.delete_file(&id).await?;
    // Best effort: the blob may be shared with an identical upload.
    if let Err(e) = state.storage.delete_file(&file.storage_key).await {
        tracing::warn!(file = %id, error = %e, "blob delete failed");
    }
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /files/{fileId}/download` -- stream the file bytes.
pub async fn download(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(file_id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    state.authorize(&headers, &jar, "GET /files/:id/download", READ).await?;
    let file = state
        .store
        .file(&FileId::new(file_id))
        .await?
        .ok_or_else(|| ServerError::not_found("file not found"))?;

    let stream = state.storage.get_file_stream(&file.storage_key, None).await?;
    let response = axum::response::Response::builder()
        .header(header::CONTENT_TYPE, &file.content_type)
        .header(
            header::ETAG,
            file.etag.clone().unwrap_or_else(|| file.content_hash.clone()),
        )
        .body(Body::from_stream(stream))
        .map_err(|e| ServerError::internal(e.to_string()))?;
    Ok(response)
}

#[derive(Debug, Deserialize)]
pub struct BatchDeleteBody {
    pub ids: Vec<String>,
}

/// `POST /files/batch/delete` -- per-item results.
pub async fn batch_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<BatchDeleteBody>,
) -> Result<impl IntoResponse, ServerError> {
    state.authorize(&headers, &jar, "POST /files/batch/delete", WRITE).await?;
    let mut results = Vec::with_capacity(body.ids.len());
    for raw_id in body.ids {
        let id = FileId::new(raw_id.clone());
        match state.store.delete_file(&id).await {
            Ok(()) => results.push(serde_json::json!({"id": raw_id, "status": "deleted"})),
            Err(e) => {
                let err: ServerError = e.into();
                results.push(serde_json::json!({
                    "id": raw_id,
                    "status": "error",
                    "code": err.code,
                    "message": err.message,
                }));
            }
        }
    }
    Ok(Json(serde_json::json!({"results": results})))
}

#[derive(Debug, Deserialize)]
pub struct BatchMoveBody {
    pub moves: Vec<MoveItem>,
}

#[derive(Debug, Deserialize)]
pub struct MoveItem {
    pub id: String,
    pub key: String,
}

/// `POST /files/batch/move` -- rename logical keys. Containing bundles are
/// force-rebuilt so archive entry names track the new keys.
pub async fn batch_move(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<BatchMoveBody>,
) -> Result<impl IntoResponse, ServerError> {
    state.authorize(&headers, &jar, "POST /files/batch/move", WRITE).await?;
    let mut results = Vec::with_capacity(body.moves.len());
    let mut moved = Vec::new();
    for item in body.moves {
        let id = FileId::new(item.id.clone());
        let outcome = async {
            let mut file = state
                .store
                .file(&id)
                .await?
                .ok_or_else(|| ServerError::not_found("file not found"))?;
            file.key = item.key.clone();
            file.updated_at = Utc::now();
            state.store.update_file(file).await?;
            Ok::<(), ServerError>(())
        }
        .await;
        match outcome {
            Ok(()) => {
                moved.push(id);
                results.push(serde_json::json!({"id": item.id, "status": "moved"}));
            }
            Err(e) => results.push(serde_json::json!({
                "id": item.id,
                "status": "error",
                "code": e.code,
                "message": e.message,
            })),
        }
    }

    // The digest ignores keys, so force the rebuild.
    let bundles = state.store.bundles_containing_files(&moved).await?;
    for bundle in bundles {
        state.scheduler.schedule(&bundle, true);
    }
    Ok(Json(serde_json::json!({"results": results})))
}
