//! Route wiring and shared handler plumbing.

pub mod auth_admin;
pub mod auth_cli;
pub mod auth_recipient;
pub mod bundles;
pub mod definitions;
pub mod files;
pub mod health;
pub mod pipelines;
pub mod portal;
pub mod recipients;

use std::sync::Arc;

use axum::Router;
use axum::http::HeaderMap;
use axum::routing::{delete, get, post};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use latchflow_bundles::{BundleScheduler, DownloadGuard};
use latchflow_crypto::ConfigCipher;
use latchflow_email::EmailProvider;
use latchflow_plugin::PluginRegistry;
use latchflow_queue::QueueDriver;
use latchflow_storage::StorageService;
use latchflow_store::LatchflowStore;
use latchflow_triggers::TriggerManager;

use crate::auth::middleware::{AuthedActor, require_admin_or_api_token};
use crate::auth::policy::{Compiled, DecisionLog};
use crate::auth::service::{AuthService, DeviceTokenCache};
use crate::config::LatchflowConfig;
use crate::error::ServerError;
use crate::ratelimit::RateLimiter;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<LatchflowConfig>,
    pub store: Arc<dyn LatchflowStore>,
    pub storage: StorageService,
    pub queue: Arc<dyn QueueDriver>,
    pub scheduler: BundleScheduler,
    pub guard: Arc<DownloadGuard>,
    pub manager: Arc<TriggerManager>,
    pub registry: Arc<PluginRegistry>,
    pub email: Arc<dyn EmailProvider>,
    pub auth: Arc<AuthService>,
    pub policy: Arc<Compiled>,
    pub authz_log: Arc<DecisionLog>,
    pub cipher: Arc<ConfigCipher>,
    pub rate_limiter: Arc<RateLimiter>,
    pub device_tokens: Arc<DeviceTokenCache>,
}

impl AppState {
    /// Run the admin-or-token gate for one request.
    pub async fn authorize(
        &self,
        headers: &HeaderMap,
        jar: &CookieJar,
        policy_signature: &str,
        scopes: &[&str],
    ) -> Result<AuthedActor, ServerError> {
        require_admin_or_api_token(
            &self.auth,
            &self.policy,
            &self.authz_log,
            &self.config,
            headers,
            jar,
            policy_signature,
            scopes,
        )
        .await
    }
}

/// Best-effort client IP for rate limiting and download events.
pub(crate) fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_owned())
        .unwrap_or_else(|| "unknown".to_owned())
}

pub(crate) fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_owned()
}

/// Build a session cookie: `HttpOnly; SameSite=Lax; Path=/`, `Secure` per
/// configuration.
pub(crate) fn session_cookie(
    name: &str,
    value: String,
    max_age: time::Duration,
    secure: bool,
) -> Cookie<'static> {
    Cookie::build((name.to_owned(), value))
        .http_only(true)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(max_age)
        .secure(secure)
        .build()
}

/// A `Max-Age=0` clearing cookie; sent on logout even when no valid
/// session existed.
pub(crate) fn clear_cookie(name: &str, secure: bool) -> Cookie<'static> {
    Cookie::build((name.to_owned(), String::new()))
        .http_only(true)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(time::Duration::ZERO)
        .secure(secure)
        .build()
}

/// Build the router with every route of the admin API, portal subset, and
/// auth ceremonies.
#[allow(clippy::too_many_lines)]
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/health", get(health::health))
        // Admin auth
        .route("/auth/admin/start", post(auth_admin::start))
        .route("/auth/admin/callback", get(auth_admin::callback))
        .route("/auth/admin/logout", post(auth_admin::logout))
        // Recipient auth
        .route("/auth/recipient/start", post(auth_recipient::start))
        .route("/auth/recipient/verify", post(auth_recipient::verify))
        .route("/portal/auth/otp/resend", post(auth_recipient::resend))
        .route("/auth/recipient/logout", post(auth_recipient::logout))
        // CLI device-code flow + token management
        .route("/auth/cli/device/start", post(auth_cli::device_start))
        .route("/auth/cli/device/approve", post(auth_cli::device_approve))
        .route("/auth/cli/device/poll", post(auth_cli::device_poll))
        .route(
            "/auth/cli/tokens",
            get(auth_cli::list_tokens).post(auth_cli::list_tokens_post),
        )
        .route("/auth/cli/tokens/revoke", post(auth_cli::revoke_token))
        .route("/auth/cli/tokens/rotate", post(auth_cli::rotate_token))
        // Bundles (admin)
        .route("/bundles", get(bundles::list).post(bundles::create))
        .route(
            "/bundles/{bundleId}",
            get(bundles::get_one)
                .patch(bundles::update)
                .delete(bundles::remove),
        )
        .route("/bundles/{bundleId}/objects", post(bundles::add_object))
        .route(
            "/bundles/{bundleId}/objects/{objectId}",
            post(bundles::update_object),
        )
        .route("/bundles/{bundleId}/versions", get(bundles::versions))
        .route(
            "/bundles/{bundleId}/versions/{version}",
            get(bundles::version_at),
        )
        .route(
            "/bundles/{bundleId}/recipients",
            post(bundles::assign_recipient).delete(bundles::unassign_recipient),
        )
        .route(
            "/bundles/{bundleId}/recipients/batch",
            post(bundles::assign_recipients_batch),
        )
        .route("/admin/bundles/{bundleId}/build", post(bundles::build))
        .route(
            "/admin/bundles/{bundleId}/build/status",
            get(bundles::build_status),
        )
        // Files (admin)
        .route("/files", get(files::list))
        .route("/files/upload", post(files::upload))
        .route("/files/upload-url", post(files::upload_url))
        .route("/files/commit", post(files::commit))
        .route("/files/{fileId}", get(files::get_one).delete(files::remove))
        .route("/files/{fileId}/download", get(files::download))
        .route("/files/batch/delete", post(files::batch_delete))
        .route("/files/batch/move", post(files::batch_move))
        // Recipients (admin)
        .route(
            "/recipients",
            get(recipients::list).post(recipients::create),
        )
        .route(
            "/recipients/{recipientId}",
            get(recipients::get_one)
                .patch(recipients::update)
                .delete(recipients::remove),
        )
        // Trigger/action definitions and pipelines (admin)
        .route(
            "/triggers",
            get(definitions::list_triggers).post(definitions::create_trigger),
        )
        .route(
            "/triggers/{triggerId}",
            get(definitions::get_trigger)
                .patch(definitions::update_trigger)
                .delete(definitions::delete_trigger),
        )
        .route(
            "/actions",
            get(definitions::list_actions).post(definitions::create_action),
        )
        .route(
            "/actions/{actionId}",
            get(definitions::get_action)
                .patch(definitions::update_action)
                .delete(definitions::delete_action),
        )
        .route("/actions/{actionId}/invoke", post(definitions::invoke_action))
        .route("/plugins/capabilities", get(definitions::list_capabilities))
        .route(
            "/pipelines",
            get(pipelines::list).post(pipelines::create),
        )
        .route(
            "/pipelines/{pipelineId}",
            get(pipelines::get_one)
                .patch(pipelines::update)
                .delete(pipelines::remove),
        )
        .route("/pipelines/{pipelineId}/steps", post(pipelines::add_step))
        .route(
            "/pipelines/{pipelineId}/steps/{stepId}",
            post(pipelines::update_step).delete(pipelines::remove_step),
        )
        .route(
            "/pipelines/{pipelineId}/triggers",
            post(pipelines::attach_trigger),
        )
        .route(
            "/pipelines/{pipelineId}/triggers/{attachmentId}",
            delete(pipelines::detach_trigger),
        )
        // Portal (recipient session)
        .route("/portal/me", get(portal::me))
        .route("/portal/bundles", get(portal::list_bundles))
        .route("/portal/assignments", get(portal::list_assignments))
        .route(
            "/portal/bundles/{bundleId}/objects",
            get(portal::bundle_objects),
        )
        .route("/portal/bundles/{bundleId}", get(portal::download))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
