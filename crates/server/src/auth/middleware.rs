//! The admin-or-token gate every admin route runs through.

use axum::http::HeaderMap;
use axum_extra::extract::cookie::CookieJar;

use latchflow_core::UserId;

use crate::config::LatchflowConfig;
use crate::error::ServerError;

use super::policy::{Compiled, DecisionLog};
use super::service::AuthService;

/// Who was authorized, and how.
#[derive(Debug, Clone)]
pub struct AuthedActor {
    pub user_id: UserId,
    pub via_bearer: bool,
}

/// Authenticate and authorize an admin request.
///
/// A `Authorization: Bearer ...` header is authoritative when present -- the
/// cookie is never consulted as a fallback. Bearer tokens are checked for
/// the required `scopes`; session cookies are checked against the compiled
/// policy via `policy_signature` (`"METHOD /path"`). Every outcome is
/// logged to the decision log.
pub async fn require_admin_or_api_token(
    auth: &AuthService,
    policy: &Compiled,
    log: &DecisionLog,
    config: &LatchflowConfig,
    headers: &HeaderMap,
    jar: &CookieJar,
    policy_signature: &str,
    scopes: &[&str],
) -> Result<AuthedActor, ServerError> {
    if let Some(header) = headers.get(axum::http::header::AUTHORIZATION) {
        let raw = header
            .to_str()
            .ok()
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| {
                log.log("DENY", "malformed authorization header", policy_signature, None);
                ServerError::unauthorized("malformed authorization header")
            })?;

        let token = auth.bearer_auth(raw).await.inspect_err(|_| {
            log.log("DENY", "invalid api token", policy_signature, None);
        })?;

        let missing: Vec<&&str> = scopes
            .iter()
            .filter(|s| !token.scopes.iter().any(|have| have == **s))
            .collect();
        if !missing.is_empty() {
            log.log(
                "DENY",
                format!("missing scopes: {missing:?}"),
                policy_signature,
                Some(token.user_id.clone()),
            );
            return Err(ServerError::forbidden(format!(
                "token lacks required scopes: {missing:?}"
            )));
        }

        log.log(
            "ALLOW",
            "api token with required scopes",
            policy_signature,
            Some(token.user_id.clone()),
        );
        return Ok(AuthedActor {
            user_id: token.user_id,
            via_bearer: true,
        });
    }

    let raw_cookie = jar
        .get(&config.admin_session_cookie)
        .map(|c| c.value().to_owned())
        .ok_or_else(|| {
            log.log("DENY", "no session cookie", policy_signature, None);
            ServerError::unauthorized("admin session required")
        })?;

    let (_session, user) = auth.validate_admin_session(&raw_cookie).await.inspect_err(|_| {
        log.log("DENY", "invalid session", policy_signature, None);
    })?;

    if !policy.allows(user.is_admin, policy_signature) {
        log.log(
            "DENY",
            "no matching policy rule",
            policy_signature,
            Some(user.id.clone()),
        );
        return Err(ServerError::forbidden("not permitted"));
    }

    log.log(
        "ALLOW",
        if user.is_admin {
            "admin session"
        } else {
            "policy rule matched"
        },
        policy_signature,
        Some(user.id.clone()),
    );
    Ok(AuthedActor {
        user_id: user.id,
        via_bearer: false,
    })
}
