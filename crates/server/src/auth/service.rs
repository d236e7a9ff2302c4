//! The shared substrate of the three auth ceremonies.
//!
//! All secrets live hash-only at rest; comparisons are constant-time. Raw
//! CLI tokens are parked exactly once in the process-local
//! [`DeviceTokenCache`] between approval and first poll.

use std::sync::Arc;

use axum::http::StatusCode;
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use tracing::warn;

use latchflow_core::{
    ApiToken, DeviceAuth, DeviceAuthId, MagicLink, Recipient, RecipientOtp, RecipientSession,
    Session, TokenId, User, UserId, auth::DeviceAuthStatus, codes,
};
use latchflow_crypto::{constant_time_eq, generate_numeric_otp, generate_token, sha256_hex};
use latchflow_email::{EmailMessage, EmailProvider};
use latchflow_store::LatchflowStore;

use crate::config::LatchflowConfig;
use crate::error::ServerError;
use crate::ratelimit::RateLimiter;

const MAX_OTP_ATTEMPTS: u32 = 5;

/// Process-local stash of raw CLI tokens keyed by device-code hash.
///
/// Entries are single-use (removed on first successful poll) and vanish on
/// restart by design -- a poll after a restart yields `410 UNAVAILABLE`.
#[derive(Debug, Default)]
pub struct DeviceTokenCache {
    tokens: DashMap<String, String>,
}

impl DeviceTokenCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn park(&self, device_code_hash: String, raw_token: String) {
        self.tokens.insert(device_code_hash, raw_token);
    }

    /// Remove and return the parked token, if any.
    pub fn take(&self, device_code_hash: &str) -> Option<String> {
        self.tokens.remove(device_code_hash).map(|(_, raw)| raw)
    }
}

/// Response of `device/start`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeviceStart {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in: u64,
    pub interval: u64,
}

/// Outcome of `device/poll`.
#[derive(Debug)]
pub enum DevicePollOutcome {
    /// Not approved yet: `202`.
    Pending,
    /// Approved and not yet collected: the raw token, exactly once.
    Issued { access_token: String },
}

/// Auth ceremonies over the store, email provider, and rate limiter.
pub struct AuthService {
    store: Arc<dyn LatchflowStore>,
    email: Arc<dyn EmailProvider>,
    config: Arc<LatchflowConfig>,
    rate: Arc<RateLimiter>,
    device_tokens: Arc<DeviceTokenCache>,
}

impl AuthService {
    pub fn new(
        store: Arc<dyn LatchflowStore>,
        email: Arc<dyn EmailProvider>,
        config: Arc<LatchflowConfig>,
        rate: Arc<RateLimiter>,
        device_tokens: Arc<DeviceTokenCache>,
    ) -> Self {
        Self {
            store,
            email,
            config,
            rate,
            device_tokens,
        }
    }

    fn rate_check(&self, ip: &str, subject: &str) -> Result<(), ServerError> {
        self.rate
            .check(ip, subject)
            .map_err(ServerError::rate_limited)
    }

    async fn resolve_recipient(&self, identity: &str) -> Result<Option<Recipient>, ServerError> {
        if let Some(found) = self.store.recipient_by_email(identity).await? {
            return Ok(Some(found));
        }
        Ok(self.store.recipient(&identity.into()).await?)
    }

    // -- Recipient OTP -----------------------------------------------------

    /// Start (or restart) the OTP ceremony. Always succeeds from the
    /// caller's perspective so recipient existence never leaks.
    pub async fn recipient_otp_start(&self, identity: &str, ip: &str) -> Result<(), ServerError> {
        self.rate_check(ip, &format!("otp:{identity}"))?;

        let Some(recipient) = self.resolve_recipient(identity).await? else {
            return Ok(());
        };
        if !recipient.is_enabled {
            return Ok(());
        }

        let otp = generate_numeric_otp(self.config.recipient_otp_length);
        let now = Utc::now();
        self.store
            .replace_recipient_otp(RecipientOtp {
                id: uuid::Uuid::new_v4().to_string(),
                recipient_id: recipient.id.clone(),
                otp_hash: sha256_hex(otp.as_bytes()),
                attempts: 0,
                expires_at: now
                    + ChronoDuration::from_std(self.config.recipient_otp_ttl)
                        .unwrap_or_else(|_| ChronoDuration::minutes(10)),
                created_at: now,
            })
            .await?;

        let message = EmailMessage::text(
            &recipient.email,
            "Your Latchflow access code",
            format!(
                "Your one-time access code is {otp}. It expires in {} minutes.",
                self.config.recipient_otp_ttl.as_secs() / 60
            ),
        )
        .map_err(|e| ServerError::internal(e.to_string()))?;
        if let Err(e) = self.email.send(&message).await {
            // Delivery failures must not leak recipient existence.
            warn!(error = %e, "otp email delivery failed");
        }
        Ok(())
    }

    /// Verify an OTP and mint a recipient session. Returns the raw session
    /// token to set as the cookie value.
    pub async fn recipient_otp_verify(
        &self,
        identity: &str,
        otp: &str,
        ip: &str,
    ) -> Result<(Recipient, String), ServerError> {
        self.rate_check(ip, &format!("otp:{identity}"))?;
        let invalid = || ServerError::unauthorized("invalid code");

        let recipient = self
            .resolve_recipient(identity)
            .await?
            .filter(|r| r.is_enabled)
            .ok_or_else(invalid)?;
        let row = self
            .store
            .active_otp_for_recipient(&recipient.id)
            .await?
            .ok_or_else(invalid)?;

        let now = Utc::now();
        if row.expires_at <= now {
            self.store.delete_otp(&row.id).await?;
            return Err(invalid());
        }

        let attempts = self.store.increment_otp_attempts(&row.id).await?;
        if attempts > MAX_OTP_ATTEMPTS {
            self.store.delete_otp(&row.id).await?;
            return Err(invalid());
        }

        if !constant_time_eq(sha256_hex(otp.as_bytes()).as_bytes(), row.otp_hash.as_bytes()) {
            return Err(invalid());
        }

        self.store.delete_otp(&row.id).await?;

        let raw = generate_token(32);
        self.store
            .create_recipient_session(RecipientSession {
                id: uuid::Uuid::new_v4().to_string(),
                recipient_id: recipient.id.clone(),
                token_hash: sha256_hex(raw.as_bytes()),
                expires_at: now
                    + ChronoDuration::from_std(self.config.recipient_session_ttl)
                        .unwrap_or_else(|_| ChronoDuration::hours(2)),
                created_at: now,
                revoked_at: None,
            })
            .await?;
        Ok((recipient, raw))
    }

    /// Revoke the recipient session for a raw cookie value. Idempotent.
    pub async fn recipient_logout(&self, raw_token: &str) -> Result<(), ServerError> {
        self.store
            .revoke_recipient_session(&sha256_hex(raw_token.as_bytes()))
            .await?;
        Ok(())
    }

    /// Resolve a raw recipient-session cookie to its recipient.
    pub async fn validate_recipient_session(
        &self,
        raw_token: &str,
    ) -> Result<(RecipientSession, Recipient), ServerError> {
        let invalid = || ServerError::unauthorized("recipient session required");
        let session = self
            .store
            .recipient_session_by_token_hash(&sha256_hex(raw_token.as_bytes()))
            .await?
            .ok_or_else(invalid)?;
        if session.revoked_at.is_some() || session.expires_at <= Utc::now() {
            return Err(invalid());
        }
        let recipient = self
            .store
            .recipient(&session.recipient_id)
            .await?
            .filter(|r| r.is_enabled)
            .ok_or_else(invalid)?;
        Ok((session, recipient))
    }

    // -- Admin magic link --------------------------------------------------

    /// Begin the admin magic-link ceremony. Returns the login URL when dev
    /// auth is allowed; otherwise the link goes out by email only.
    pub async fn admin_magic_start(
        &self,
        email: &str,
        ip: &str,
    ) -> Result<Option<String>, ServerError> {
        self.rate_check(ip, &format!("magic:{email}"))?;
        if !email.contains('@') {
            return Err(ServerError::bad_request("invalid email"));
        }

        let user = self.store.upsert_user_by_email(email).await?;
        let raw = generate_token(32);
        let now = Utc::now();
        self.store
            .create_magic_link(MagicLink {
                id: uuid::Uuid::new_v4().to_string(),
                user_id: user.id.clone(),
                token_hash: sha256_hex(raw.as_bytes()),
                expires_at: now
                    + ChronoDuration::from_std(self.config.magic_link_ttl)
                        .unwrap_or_else(|_| ChronoDuration::minutes(15)),
                consumed_at: None,
                created_at: now,
            })
            .await?;

        let login_url = format!(
            "{}/auth/admin/callback?token={raw}",
            self.config.public_base_url
        );
        if self.config.allow_dev_auth {
            return Ok(Some(login_url));
        }

        let message = EmailMessage::text(
            &user.email,
            "Sign in to Latchflow",
            format!(
                "Follow this link to sign in: {login_url}\nIt expires in {} minutes.",
                self.config.magic_link_ttl.as_secs() / 60
            ),
        )
        .map_err(|e| ServerError::internal(e.to_string()))?;
        if let Err(e) = self.email.send(&message).await {
            warn!(error = %e, "magic link email delivery failed");
        }
        Ok(None)
    }

    /// Consume a magic link and mint an admin session.
    pub async fn admin_magic_callback(
        &self,
        raw_token: &str,
    ) -> Result<(User, String), ServerError> {
        let now = Utc::now();
        let link = self
            .store
            .consume_magic_link(&sha256_hex(raw_token.as_bytes()), now)
            .await
            .map_err(|e| match e {
                latchflow_store::StoreError::NotFound { .. } => {
                    ServerError::unauthorized("invalid login link")
                }
                latchflow_store::StoreError::Consumed(_)
                | latchflow_store::StoreError::Expired(_) => {
                    ServerError::new(StatusCode::GONE, codes::EXPIRED, "login link expired")
                }
                other => other.into(),
            })?;

        let user = self
            .store
            .user(&link.user_id)
            .await?
            .ok_or_else(|| ServerError::unauthorized("user no longer exists"))?;

        let raw = generate_token(32);
        self.store
            .create_session(Session {
                id: uuid::Uuid::new_v4().to_string(),
                user_id: user.id.clone(),
                token_hash: sha256_hex(raw.as_bytes()),
                expires_at: now
                    + ChronoDuration::from_std(self.config.admin_session_ttl)
                        .unwrap_or_else(|_| ChronoDuration::hours(12)),
                created_at: now,
                revoked_at: None,
            })
            .await?;
        Ok((user, raw))
    }

    /// Revoke the admin session for a raw cookie value. Idempotent.
    pub async fn admin_logout(&self, raw_token: &str) -> Result<(), ServerError> {
        self.store
            .revoke_session(&sha256_hex(raw_token.as_bytes()))
            .await?;
        Ok(())
    }

    /// Resolve a raw admin-session cookie to its user.
    pub async fn validate_admin_session(
        &self,
        raw_token: &str,
    ) -> Result<(Session, User), ServerError> {
        let invalid = || ServerError::unauthorized("admin session required");
        let session = self
            .store
            .session_by_token_hash(&sha256_hex(raw_token.as_bytes()))
            .await?
            .ok_or_else(invalid)?;
        if session.revoked_at.is_some() || session.expires_at <= Utc::now() {
            return Err(invalid());
        }
        let user = self
            .store
            .user(&session.user_id)
            .await?
            .ok_or_else(invalid)?;
        Ok((session, user))
    }

    // -- CLI device code ---------------------------------------------------

    /// Begin the device-code ceremony.
    pub async fn device_start(
        &self,
        email: &str,
        device_name: Option<String>,
        ip: &str,
    ) -> Result<DeviceStart, ServerError> {
        self.rate_check(ip, &format!("device:{email}"))?;
        if !email.contains('@') {
            return Err(ServerError::bad_request("invalid email"));
        }

        let device_code = generate_token(32);
        let user_code = user_code_from_token();
        let now = Utc::now();
        let interval = self.config.device_code_interval.as_secs();
        let expires_in = self.config.device_code_ttl.as_secs();

        self.store
            .create_device_auth(DeviceAuth {
                id: DeviceAuthId::generate(),
                email: email.to_lowercase(),
                device_name,
                device_code_hash: sha256_hex(device_code.as_bytes()),
                user_code_hash: sha256_hex(normalize_user_code(&user_code).as_bytes()),
                status: DeviceAuthStatus::Pending,
                token_id: None,
                interval_secs: interval as u32,
                last_polled_at: None,
                expires_at: now + ChronoDuration::seconds(expires_in as i64),
                created_at: now,
            })
            .await?;

        Ok(DeviceStart {
            device_code,
            user_code,
            verification_uri: format!("{}/cli/verify", self.config.public_base_url),
            expires_in,
            interval,
        })
    }

    /// Approve a user code on behalf of an authenticated admin, minting the
    /// API token and parking its raw value for the CLI's next poll.
    pub async fn device_approve(
        &self,
        user_code: &str,
        admin: &UserId,
    ) -> Result<(), ServerError> {
        let mut device = self
            .store
            .device_auth_by_user_code_hash(&sha256_hex(
                normalize_user_code(user_code).as_bytes(),
            ))
            .await?
            .ok_or_else(|| {
                ServerError::new(StatusCode::BAD_REQUEST, codes::INVALID_CODE, "unknown code")
            })?;

        let now = Utc::now();
        if device.expires_at <= now {
            return Err(ServerError::new(
                StatusCode::GONE,
                codes::EXPIRED,
                "device code expired",
            ));
        }
        if device.status != DeviceAuthStatus::Pending {
            return Err(ServerError::conflict(
                codes::CONFLICT,
                "device code already decided",
            ));
        }

        let raw_token = format!("{}{}", self.config.api_token_prefix, generate_token(32));
        let token = ApiToken {
            id: TokenId::generate(),
            user_id: admin.clone(),
            name: device.device_name.clone(),
            token_hash: sha256_hex(raw_token.as_bytes()),
            scopes: self.config.api_token_scopes_default.clone(),
            expires_at: self
                .config
                .api_token_ttl
                .and_then(|ttl| ChronoDuration::from_std(ttl).ok())
                .map(|ttl| now + ttl),
            created_at: now,
            revoked_at: None,
            last_used_at: None,
        };
        self.store.create_api_token(token.clone()).await?;
        self.device_tokens
            .park(device.device_code_hash.clone(), raw_token);

        device.status = DeviceAuthStatus::Approved;
        device.token_id = Some(token.id);
        self.store.update_device_auth(device).await?;
        Ok(())
    }

    /// One poll from the CLI.
    pub async fn device_poll(
        &self,
        device_code: &str,
    ) -> Result<DevicePollOutcome, ServerError> {
        let mut device = self
            .store
            .device_auth_by_device_code_hash(&sha256_hex(device_code.as_bytes()))
            .await?
            .ok_or_else(|| {
                ServerError::new(StatusCode::BAD_REQUEST, codes::INVALID_CODE, "unknown code")
            })?;

        let now = Utc::now();
        if device.expires_at <= now {
            return Err(ServerError::new(
                StatusCode::GONE,
                codes::EXPIRED,
                "device code expired",
            ));
        }
        if device.status == DeviceAuthStatus::Revoked {
            return Err(ServerError::new(
                StatusCode::GONE,
                codes::REVOKED,
                "device code revoked",
            ));
        }

        // Enforce the poll interval before any state transition.
        if let Some(last) = device.last_polled_at {
            let min_gap = ChronoDuration::seconds(i64::from(device.interval_secs));
            if now - last < min_gap {
                let mut err = ServerError::new(
                    StatusCode::TOO_MANY_REQUESTS,
                    codes::SLOW_DOWN,
                    "polling too fast",
                );
                err.retry_after = Some(u64::from(device.interval_secs));
                return Err(err);
            }
        }
        device.last_polled_at = Some(now);

        match device.status {
            DeviceAuthStatus::Pending => {
                self.store.update_device_auth(device).await?;
                Ok(DevicePollOutcome::Pending)
            }
            DeviceAuthStatus::Approved => {
                match self.device_tokens.take(&device.device_code_hash) {
                    Some(access_token) => {
                        device.status = DeviceAuthStatus::Consumed;
                        self.store.update_device_auth(device).await?;
                        Ok(DevicePollOutcome::Issued { access_token })
                    }
                    // The raw token was lost (restart) or already collected.
                    None => {
                        self.store.update_device_auth(device).await?;
                        Err(ServerError::new(
                            StatusCode::GONE,
                            codes::UNAVAILABLE,
                            "token no longer available",
                        ))
                    }
                }
            }
            DeviceAuthStatus::Consumed => {
                self.store.update_device_auth(device).await?;
                Err(ServerError::new(
                    StatusCode::GONE,
                    codes::UNAVAILABLE,
                    "token already collected",
                ))
            }
            DeviceAuthStatus::Revoked => unreachable!("handled above"),
        }
    }

    // -- API tokens --------------------------------------------------------

    /// Validate a raw bearer token: unknown, revoked, or expired is 401.
    pub async fn bearer_auth(&self, raw_token: &str) -> Result<ApiToken, ServerError> {
        let invalid = || ServerError::unauthorized("invalid api token");
        let mut token = self
            .store
            .api_token_by_hash(&sha256_hex(raw_token.as_bytes()))
            .await?
            .ok_or_else(invalid)?;
        if !token.is_active(Utc::now()) {
            return Err(invalid());
        }
        token.last_used_at = Some(Utc::now());
        // Usage stamping is best-effort.
        let _ = self.store.update_api_token(token.clone()).await;
        Ok(token)
    }

    /// Tokens owned by `user`.
    pub async fn list_tokens(&self, user: &UserId) -> Result<Vec<ApiToken>, ServerError> {
        Ok(self.store.api_tokens_for_user(user).await?)
    }

    /// Revoke an owned token.
    pub async fn revoke_token(&self, id: &TokenId, user: &UserId) -> Result<(), ServerError> {
        let mut token = self
            .owned_token(id, user)
            .await?;
        token.revoked_at = Some(Utc::now());
        self.store.update_api_token(token).await?;
        Ok(())
    }

    /// Rotate an owned token: same row and scopes, fresh secret.
    pub async fn rotate_token(
        &self,
        id: &TokenId,
        user: &UserId,
    ) -> Result<String, ServerError> {
        let mut token = self.owned_token(id, user).await?;
        if token.revoked_at.is_some() {
            return Err(ServerError::new(
                StatusCode::GONE,
                codes::REVOKED,
                "token is revoked",
            ));
        }
        let raw = format!("{}{}", self.config.api_token_prefix, generate_token(32));
        token.token_hash = sha256_hex(raw.as_bytes());
        self.store.update_api_token(token).await?;
        Ok(raw)
    }

    async fn owned_token(&self, id: &TokenId, user: &UserId) -> Result<ApiToken, ServerError> {
        self.store
            .api_token(id)
            .await?
            .filter(|t| &t.user_id == user)
            .ok_or_else(|| ServerError::not_found("token not found"))
    }
}

/// Human-entered verification code, `XXXX-XXXX` over an unambiguous
/// uppercase alphabet.
fn user_code_from_token() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let raw = generate_token(16);
    let chars: Vec<char> = raw
        .bytes()
        .map(|b| char::from(ALPHABET[(b as usize) % ALPHABET.len()]))
        .take(8)
        .collect();
    format!(
        "{}-{}",
        chars[..4].iter().collect::<String>(),
        chars[4..].iter().collect::<String>()
    )
}

/// Case- and dash-insensitive form used for hashing user codes.
fn normalize_user_code(code: &str) -> String {
    code.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_code_shape() {
        let code = user_code_from_token();
        assert_eq!(code.len(), 9);
        assert_eq!(&code[4..5], "-");
        assert!(code.chars().all(|c| c == '-' || c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn user_code_normalization_ignores_case_and_dashes() {
        assert_eq!(normalize_user_code("abcd-efgh"), "ABCDEFGH");
        assert_eq!(normalize_user_code("ABCDEFGH"), "ABCDEFGH");
    }
}
