//! Authentication state: users, sessions, one-time credentials, API tokens.
//!
//! Every credential artifact here stores only the SHA-256 hex hash of its
//! secret. Raw secrets exist transiently: in the email/URL delivered to the
//! subject, or in the process-local device-token cache until first poll.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{DeviceAuthId, RecipientId, TokenId, UserId};

/// An admin user, created on first magic-link request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub name: Option<String>,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

/// An admin browser session backed by the `lf_admin_sess` cookie.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: UserId,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// A single-use admin login link. Consumed atomically on callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MagicLink {
    pub id: String,
    pub user_id: UserId,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A pending recipient OTP. At most one active row per recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientOtp {
    pub id: String,
    pub recipient_id: RecipientId,
    pub otp_hash: String,
    /// Verification attempts consumed so far; 5 is the ceiling.
    pub attempts: u32,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A recipient portal session backed by the `lf_recipient_sess` cookie.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientSession {
    pub id: String,
    pub recipient_id: RecipientId,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Lifecycle of a CLI device-code grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceAuthStatus {
    Pending,
    Approved,
    Consumed,
    Revoked,
}

/// A CLI device-code flow in progress.
///
/// Both codes are stored hashed; the CLI polls with the device code while a
/// browser session approves the user code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAuth {
    pub id: DeviceAuthId,
    pub email: String,
    pub device_name: Option<String>,
    pub device_code_hash: String,
    pub user_code_hash: String,
    pub status: DeviceAuthStatus,
    /// Token minted at approval, linked for revocation bookkeeping.
    pub token_id: Option<TokenId>,
    /// Minimum seconds between polls.
    pub interval_secs: u32,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A bearer API token with scopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiToken {
    pub id: TokenId,
    pub user_id: UserId,
    pub name: Option<String>,
    pub token_hash: String,
    /// Fixed scope strings, e.g. `"bundles:read"`.
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiToken {
    /// Whether the token is usable at `now`.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at.is_none_or(|exp| exp > now)
    }

    /// Whether the token carries every scope in `required`.
    #[must_use]
    pub fn has_scopes(&self, required: &[&str]) -> bool {
        required
            .iter()
            .all(|scope| self.scopes.iter().any(|s| s == scope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(scopes: &[&str]) -> ApiToken {
        ApiToken {
            id: TokenId::generate(),
            user_id: UserId::generate(),
            name: None,
            token_hash: "h".repeat(64),
            scopes: scopes.iter().map(|s| (*s).to_owned()).collect(),
            expires_at: None,
            created_at: Utc::now(),
            revoked_at: None,
            last_used_at: None,
        }
    }

    #[test]
    fn token_scope_check() {
        let t = token(&["bundles:read", "files:read"]);
        assert!(t.has_scopes(&["bundles:read"]));
        assert!(t.has_scopes(&["bundles:read", "files:read"]));
        assert!(!t.has_scopes(&["bundles:write"]));
    }

    #[test]
    fn revoked_token_is_inactive() {
        let mut t = token(&[]);
        assert!(t.is_active(Utc::now()));
        t.revoked_at = Some(Utc::now());
        assert!(!t.is_active(Utc::now()));
    }

    #[test]
    fn expired_token_is_inactive() {
        let mut t = token(&[]);
        t.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(!t.is_active(Utc::now()));
    }
}
