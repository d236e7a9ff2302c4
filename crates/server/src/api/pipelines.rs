//! Admin CRUD for pipelines, their steps, and trigger attachments.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;
use serde::Deserialize;

use latchflow_core::{
    ActionDefId, ActorRef, Pipeline, PipelineId, PipelineStep, PipelineTrigger, TriggerDefId,
};

use super::AppState;
use crate::error::ServerError;

const READ: &[&str] = &["core:read"];
const WRITE: &[&str] = &["core:write"];

/// `GET /pipelines`
pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<impl IntoResponse, ServerError> {
    state.authorize(&headers, &jar, "GET /pipelines", READ).await?;
    let pipelines = state.store.list_pipelines().await?;
    Ok(Json(serde_json::json!({"pipelines": pipelines})))
}

#[derive(Debug, Deserialize)]
pub struct CreateBody {
    pub name: String,
    pub description: Option<String>,
}

/// `POST /pipelines`
pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<CreateBody>,
) -> Result<impl IntoResponse, ServerError> {
    let actor = state.authorize(&headers, &jar, "POST /pipelines", WRITE).await?;
    let now = Utc::now();
    let pipeline = Pipeline {
        id: PipelineId::generate(),
        name: body.name,
        description: body.description,
        is_enabled: true,
        created_at: now,
        updated_at: now,
    };
    state
        .store
        .create_pipeline(pipeline.clone(), &ActorRef::user(actor.user_id))
        .await?;
    Ok((StatusCode::CREATED, Json(pipeline)))
}

/// `GET /pipelines/{pipelineId}` -- the pipeline with its steps.
pub async fn get_one(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(pipeline_id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    state
        .authorize(&headers, &jar, "GET /pipelines/:pipelineId", READ)
        .await?;
    let id = PipelineId::new(pipeline_id);
    let pipeline = state
        .store
        .pipeline(&id)
        .await?
        .ok_or_else(|| ServerError::not_found("pipeline not found"))?;
    let steps = state.store.pipeline_steps(&id).await?;
    Ok(Json(serde_json::json!({"pipeline": pipeline, "steps": steps})))
}

#[derive(Debug, Deserialize)]
pub struct UpdateBody {
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_enabled: Option<bool>,
}

/// `PATCH /pipelines/{pipelineId}`
pub async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(pipeline_id): Path<String>,
    Json(body): Json<UpdateBody>,
) -> Result<impl IntoResponse, ServerError> {
    let actor = state
        .authorize(&headers, &jar, "PATCH /pipelines/:pipelineId", WRITE)
        .await?;
    let id = PipelineId::new(pipeline_id);
    let mut pipeline = state
        .store
        .pipeline(&id)
        .await?
        .ok_or_else(|| ServerError::not_found("pipeline not found"))?;
    if let Some(name) = body.name {
        pipeline.name = name;
    }
    if let Some(description) = body.description {
        pipeline.description = Some(description);
    }
    if let Some(enabled) = body.is_enabled {
        pipeline.is_enabled = enabled;
    }
    pipeline.updated_at = Utc::now();
    state
        .store
        .update_pipeline(pipeline.clone(), &ActorRef::user(actor.user_id))
        .await?;
    Ok(Json(pipeline))
}

/// `DELETE /pipelines/{pipelineId}` -- refuses while steps or attachments
/// exist.
pub async fn remove(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(pipeline_id): Path<String>,
) -> Result<StatusCode, ServerError> {
    state
        .authorize(&headers, &jar, "DELETE /pipelines/:pipelineId", WRITE)
        .await?;
    state.store.delete_pipeline(&PipelineId::new(pipeline_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct AddStepBody {
    pub action_id: String,
    pub sort_order: i32,
}

/// `POST /pipelines/{pipelineId}/steps`
pub async fn add_step(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(pipeline_id): Path<String>,
    Json(body): Json<AddStepBody>,
) -> Result<impl IntoResponse, ServerError> {
    let actor = state
        .authorize(&headers, &jar, "POST /pipelines/:pipelineId/steps", WRITE)
        .await?;
    let step = PipelineStep {
        id: uuid::Uuid::new_v4().to_string(),
        pipeline_id: PipelineId::new(pipeline_id),
        action_id: ActionDefId::new(body.action_id),
        sort_order: body.sort_order,
        is_enabled: true,
    };
    state
        .store
        .add_pipeline_step(step.clone(), &ActorRef::user(actor.user_id))
        .await?;
    Ok((StatusCode::CREATED, Json(step)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateStepBody {
    pub sort_order: Option<i32>,
    pub is_enabled: Option<bool>,
}

/// `POST /pipelines/{pipelineId}/steps/{stepId}` -- reorder or toggle.
pub async fn update_step(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path((pipeline_id, step_id)): Path<(String, String)>,
    Json(body): Json<UpdateStepBody>,
) -> Result<impl IntoResponse, ServerError> {
    let actor = state
        .authorize(&headers, &jar, "POST /pipelines/:pipelineId/steps/:stepId", WRITE)
        .await?;
    let id = PipelineId::new(pipeline_id);
    let mut step = state
        .store
        .pipeline_steps(&id)
        .await?
        .into_iter()
        .find(|s| s.id == step_id)
        .ok_or_else(|| ServerError::not_found("pipeline step not found"))?;
    if let Some(sort_order) = body.sort_order {
        step.sort_order = sort_order;
    }
    if let Some(enabled) = body.is_enabled {
        step.is_enabled = enabled;
    }
    state
        .store
        .update_pipeline_step(step.clone(), &ActorRef::user(actor.user_id))
        .await?;
    Ok(Json(step))
}

/// `DELETE /pipelines/{pipelineId}/steps/{stepId}`
pub async fn remove_step(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path((_pipeline_id, step_id)): Path<(String, String)>,
) -> Result<StatusCode, ServerError> {
    let actor = state
        .authorize(
            &headers,
            &jar,
            "DELETE /pipelines/:pipelineId/steps/:stepId",
            WRITE,
        )
        .await?;
    state
        .store
        .remove_pipeline_step(&step_id, &ActorRef::user(actor.user_id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct AttachTriggerBody {
    pub trigger_id: String,
    #[serde(default)]
    pub sort_order: i32,
}

/// `POST /pipelines/{pipelineId}/triggers`
pub async fn attach_trigger(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(pipeline_id): Path<String>,
    Json(body): Json<AttachTriggerBody>,
) -> Result<impl IntoResponse, ServerError> {
    let actor = state
        .authorize(&headers, &jar, "POST /pipelines/:pipelineId/triggers", WRITE)
        .await?;
    let attachment = PipelineTrigger {
        id: uuid::Uuid::new_v4().to_string(),
        pipeline_id: PipelineId::new(pipeline_id),
        trigger_id: TriggerDefId::new(body.trigger_id),
        sort_order: body.sort_order,
        is_enabled: true,
    };
    state
        .store
        .attach_trigger(attachment.clone(), &ActorRef::user(actor.user_id))
        .await?;
    Ok((StatusCode::CREATED, Json(attachment)))
}

/// `DELETE /pipelines/{pipelineId}/triggers/{attachmentId}`
pub async fn detach_trigger(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path((_pipeline_id, attachment_id)): Path<(String, String)>,
) -> Result<StatusCode, ServerError> {
    let actor = state
        .authorize(
            &headers,
            &jar,
            "DELETE /pipelines/:pipelineId/triggers/:attachmentId",
            WRITE,
        )
        .await?;
    state
        .store
        .detach_trigger(&attachment_id, &ActorRef::user(actor.user_id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
