//! Admin CRUD for trigger and action definitions, plus manual invocation
//! and the capability listing.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;
use serde::Deserialize;

use latchflow_core::{
    ActionDefId, ActionDefinition, ActorRef, CapabilityId, TriggerDefId, TriggerDefinition,
};
use latchflow_queue::ActionMessage;

use super::AppState;
use crate::error::ServerError;

const READ: &[&str] = &["core:read"];
const WRITE: &[&str] = &["core:write"];

#[derive(Debug, Deserialize)]
pub struct CreateDefinitionBody {
    pub capability_id: String,
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct UpdateDefinitionBody {
    pub name: Option<String>,
    pub config: Option<serde_json::Value>,
    pub is_enabled: Option<bool>,
}

fn map_plugin_err(e: latchflow_plugin::PluginError) -> ServerError {
    ServerError::bad_request(e.to_string())
}

/// `GET /plugins/capabilities`
pub async fn list_capabilities(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<impl IntoResponse, ServerError> {
    state
        .authorize(&headers, &jar, "GET /plugins/capabilities", READ)
        .await?;
    Ok(Json(serde_json::json!({
        "capabilities": state.registry.capabilities(),
    })))
}

/// `GET /triggers`
pub async fn list_triggers(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<impl IntoResponse, ServerError> {
    state.authorize(&headers, &jar, "GET /triggers", READ).await?;
    let triggers = state.store.list_trigger_definitions().await?;
    Ok(Json(serde_json::json!({"triggers": triggers})))
}

/// `POST /triggers` -- create a definition and start its runtime.
pub async fn create_trigger(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<CreateDefinitionBody>,
) -> Result<impl IntoResponse, ServerError> {
    let actor = state.authorize(&headers, &jar, "POST /triggers", WRITE).await?;
    let capability_id = CapabilityId::new(body.capability_id);
    state
        .registry
        .require_trigger_by_id(&capability_id)
        .map_err(map_plugin_err)?;

    let config = state
        .cipher
        .encrypt(&body.config)
        .map_err(|e| ServerError::internal(e.to_string()))?;
    let now = Utc::now();
    let def = TriggerDefinition {
        id: TriggerDefId::generate(),
        capability_id,
        name: body.name,
        config,
        is_enabled: true,
        created_at: now,
        updated_at: now,
        created_by: actor.user_id.clone(),
        updated_by: actor.user_id.clone(),
    };
    state
        .store
        .create_trigger_definition(def.clone(), &ActorRef::user(actor.user_id))
        .await?;
    if let Err(e) = state.manager.reload_trigger(&def.id).await {
        tracing::warn!(trigger = %def.id, error = %e, "trigger start after create failed");
    }
    Ok((StatusCode::CREATED, Json(def)))
}

/// `GET /triggers/{triggerId}`
pub async fn get_trigger(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(trigger_id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    state
        .authorize(&headers, &jar, "GET /triggers/:triggerId", READ)
        .await?;
    let def = state
        .store
        .trigger_definition(&TriggerDefId::new(trigger_id))
        .await?
        .ok_or_else(|| ServerError::not_found("trigger definition not found"))?;
    Ok(Json(def))
}

/// `PATCH /triggers/{triggerId}` -- update; pushes the config change into
/// the running runtime (or reloads it).
pub async fn update_trigger(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(trigger_id): Path<String>,
    Json(body): Json<UpdateDefinitionBody>,
) -> Result<impl IntoResponse, ServerError> {
    let actor = state
        .authorize(&headers, &jar, "PATCH /triggers/:triggerId", WRITE)
        .await?;
    let id = TriggerDefId::new(trigger_id);
    let mut def = state
        .store
        .trigger_definition(&id)
        .await?
        .ok_or_else(|| ServerError::not_found("trigger definition not found"))?;

    let config_changed = body.config.is_some();
    if let Some(name) = body.name {
        def.name = name;
    }
    if let Some(config) = body.config {
        def.config = state
            .cipher
            .encrypt(&config)
            .map_err(|e| ServerError::internal(e.to_string()))?;
    }
    let enablement_changed = body.is_enabled.is_some_and(|e| e != def.is_enabled);
    if let Some(enabled) = body.is_enabled {
        def.is_enabled = enabled;
    }
    def.updated_at = Utc::now();
    def.updated_by = actor.user_id.clone();
    state
        .store
        .update_trigger_definition(def.clone(), &ActorRef::user(actor.user_id))
        .await?;

    if enablement_changed {
        if let Err(e) = state.manager.reload_trigger(&def.id).await {
            tracing::warn!(trigger = %def.id, error = %e, "trigger reload failed");
        }
    } else if config_changed
        && let Err(e) = state.manager.notify_config_change(&def.id, &def.config).await
    {
        tracing::warn!(trigger = %def.id, error = %e, "trigger config change failed");
    }
    Ok(Json(def))
}

/// `DELETE /triggers/{triggerId}` -- refuses while attachments or events
/// exist.
pub async fn delete_trigger(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(trigger_id): Path<String>,
) -> Result<StatusCode, ServerError> {
    state
        .authorize(&headers, &jar, "DELETE /triggers/:triggerId", WRITE)
        .await?;
    let id = TriggerDefId::new(trigger_id);
    state.store.delete_trigger_definition(&id).await?;
    if let Err(e) = state.manager.reload_trigger(&id).await {
        tracing::warn!(trigger = %id, error = %e, "trigger stop after delete failed");
    }
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /actions`
pub async fn list_actions(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<impl IntoResponse, ServerError> {
    state.authorize(&headers, &jar, "GET /actions", READ).await?;
    let actions = state.store.list_action_definitions().await?;
    Ok(Json(serde_json::json!({"actions": actions})))
}

/// `POST /actions`
pub async fn create_action(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<CreateDefinitionBody>,
) -> Result<impl IntoResponse, ServerError> {
    let actor = state.authorize(&headers, &jar, "POST /actions", WRITE).await?;
    let capability_id = CapabilityId::new(body.capability_id);
    state
        .registry
        .require_action_by_id(&capability_id)
        .map_err(map_plugin_err)?;

    let config = state
        .cipher
        .encrypt(&body.config)
        .map_err(|e| ServerError::internal(e.to_string()))?;
    let now = Utc::now();
    let def = ActionDefinition {
        id: ActionDefId::generate(),
        capability_id,
        name: body.name,
        config,
        is_enabled: true,
        created_at: now,
        updated_at: now,
        created_by: actor.user_id.clone(),
        updated_by: actor.user_id.clone(),
    };
    state
        .store
        .create_action_definition(def.clone(), &ActorRef::user(actor.user_id))
        .await?;
    Ok((StatusCode::CREATED, Json(def)))
}

/// `GET /actions/{actionId}`
pub async fn get_action(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(action_id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    state
        .authorize(&headers, &jar, "GET /actions/:actionId", READ)
        .await?;
    let def = state
        .store
        .action_definition(&ActionDefId::new(action_id))
        .await?
        .ok_or_else(|| ServerError::not_found("action definition not found"))?;
    Ok(Json(def))
}

/// `PATCH /actions/{actionId}`
pub async fn update_action(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(action_id): Path<String>,
    Json(body): Json<UpdateDefinitionBody>,
) -> Result<impl IntoResponse, ServerError> {
    let actor = state
        .authorize(&headers, &jar, "PATCH /actions/:actionId", WRITE)
        .await?;
    let id = ActionDefId::new(action_id);
    let mut def = state
        .store
        .action_definition(&id)
        .await?
        .ok_or_else(|| ServerError::not_found("action definition not found"))?;
    if let Some(name) = body.name {
        def.name = name;
    }
    if let Some(config) = body.config {
        def.config = state
            .cipher
            .encrypt(&config)
            .map_err(|e| ServerError::internal(e.to_string()))?;
    }
    if let Some(enabled) = body.is_enabled {
        def.is_enabled = enabled;
    }
    def.updated_at = Utc::now();
    def.updated_by = actor.user_id.clone();
    state
        .store
        .update_action_definition(def.clone(), &ActorRef::user(actor.user_id))
        .await?;
    Ok(Json(def))
}

/// `DELETE /actions/{actionId}` -- refuses while steps or invocations
/// exist.
pub async fn delete_action(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(action_id): Path<String>,
) -> Result<StatusCode, ServerError> {
    state
        .authorize(&headers, &jar, "DELETE /actions/:actionId", WRITE)
        .await?;
    state
        .store
        .delete_action_definition(&ActionDefId::new(action_id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, Default)]
pub struct InvokeBody {
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

/// `POST /actions/{actionId}/invoke` -- manual invocation: one queued
/// message carrying the caller as `manual_invoker_id`.
pub async fn invoke_action(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(action_id): Path<String>,
    body: Option<Json<InvokeBody>>,
) -> Result<impl IntoResponse, ServerError> {
    let actor = state
        .authorize(&headers, &jar, "POST /actions/:actionId/invoke", WRITE)
        .await?;
    let id = ActionDefId::new(action_id);
    if state.store.action_definition(&id).await?.is_none() {
        return Err(ServerError::not_found("action definition not found"));
    }
    let context = body.and_then(|Json(b)| b.context);
    state
        .queue
        .enqueue_action(ActionMessage::manual(id, actor.user_id, context))
        .await
        .map_err(|e| ServerError::internal(e.to_string()))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"status": "queued"})),
    ))
}
