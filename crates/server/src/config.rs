//! Environment-driven configuration.
//!
//! Every knob has a default tuned for local development; production sets
//! the environment variables listed on each field.

use std::time::Duration;

/// Server configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct LatchflowConfig {
    /// `PORT` (default 3001).
    pub port: u16,
    /// `STORAGE_BUCKET` (default `latchflow`).
    pub storage_bucket: String,
    /// `STORAGE_KEY_PREFIX` (default empty).
    pub storage_key_prefix: String,
    /// `ADMIN_SESSION_COOKIE` (default `lf_admin_sess`).
    pub admin_session_cookie: String,
    /// `RECIPIENT_SESSION_COOKIE` (default `lf_recipient_sess`).
    pub recipient_session_cookie: String,
    /// `RECIPIENT_OTP_LENGTH` (default 6).
    pub recipient_otp_length: usize,
    /// `RECIPIENT_OTP_TTL_MIN` (default 10).
    pub recipient_otp_ttl: Duration,
    /// `RECIPIENT_SESSION_TTL_HOURS` (default 2).
    pub recipient_session_ttl: Duration,
    /// `ADMIN_MAGICLINK_TTL_MIN` (default 15).
    pub magic_link_ttl: Duration,
    /// `AUTH_SESSION_TTL_HOURS` (default 12).
    pub admin_session_ttl: Duration,
    /// `AUTH_COOKIE_SECURE` (default false).
    pub cookie_secure: bool,
    /// `ALLOW_DEV_AUTH` (default false): magic-link start responds with the
    /// login URL instead of only emailing it.
    pub allow_dev_auth: bool,
    /// `DEVICE_CODE_TTL_MIN` (default 10).
    pub device_code_ttl: Duration,
    /// `DEVICE_CODE_INTERVAL_SEC` (default 5).
    pub device_code_interval: Duration,
    /// `API_TOKEN_PREFIX` (default `lfk_`).
    pub api_token_prefix: String,
    /// `API_TOKEN_TTL_DAYS` (no default; `None` = non-expiring).
    pub api_token_ttl: Option<Duration>,
    /// `API_TOKEN_SCOPES_DEFAULT` (comma-separated; default `core:read`).
    pub api_token_scopes_default: Vec<String>,
    /// `HISTORY_SNAPSHOT_INTERVAL` (default 20).
    pub history_snapshot_interval: u32,
    /// `HISTORY_MAX_CHAIN_DEPTH` (default 200).
    pub history_max_chain_depth: u32,
    /// `SYSTEM_USER_ID` (default `system`).
    pub system_user_id: String,
    /// `PLUGIN_ACTION_CONCURRENCY` (default 10).
    pub plugin_action_concurrency: usize,
    /// `BUNDLE_REBUILD_DEBOUNCE_MS` (default 500).
    pub bundle_rebuild_debounce: Duration,
    /// `PUBLIC_BASE_URL` (default `http://localhost:<port>`), used in
    /// magic-link and device-code URLs.
    pub public_base_url: String,
    /// `SMTP_FROM` (default `noreply@latchflow.local`).
    pub email_from: String,
}

fn env_str(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_owned())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

impl Default for LatchflowConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            storage_bucket: "latchflow".into(),
            storage_key_prefix: String::new(),
            admin_session_cookie: "lf_admin_sess".into(),
            recipient_session_cookie: "lf_recipient_sess".into(),
            recipient_otp_length: 6,
            recipient_otp_ttl: Duration::from_secs(10 * 60),
            recipient_session_ttl: Duration::from_secs(2 * 3600),
            magic_link_ttl: Duration::from_secs(15 * 60),
            admin_session_ttl: Duration::from_secs(12 * 3600),
            cookie_secure: false,
            allow_dev_auth: false,
            device_code_ttl: Duration::from_secs(10 * 60),
            device_code_interval: Duration::from_secs(5),
            api_token_prefix: "lfk_".into(),
            api_token_ttl: None,
            api_token_scopes_default: vec!["core:read".into()],
            history_snapshot_interval: 20,
            history_max_chain_depth: 200,
            system_user_id: "system".into(),
            plugin_action_concurrency: 10,
            bundle_rebuild_debounce: Duration::from_millis(500),
            public_base_url: "http://localhost:3001".into(),
            email_from: "noreply@latchflow.local".into(),
        }
    }
}

impl LatchflowConfig {
    /// Resolve configuration from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let port = env_parse("PORT", defaults.port);
        Self {
            port,
            storage_bucket: env_str("STORAGE_BUCKET", &defaults.storage_bucket),
            storage_key_prefix: env_str("STORAGE_KEY_PREFIX", ""),
            admin_session_cookie: env_str("ADMIN_SESSION_COOKIE", &defaults.admin_session_cookie),
            recipient_session_cookie: env_str(
                "RECIPIENT_SESSION_COOKIE",
                &defaults.recipient_session_cookie,
            ),
            recipient_otp_length: env_parse("RECIPIENT_OTP_LENGTH", defaults.recipient_otp_length),
            recipient_otp_ttl: Duration::from_secs(env_parse("RECIPIENT_OTP_TTL_MIN", 10u64) * 60),
            recipient_session_ttl: Duration::from_secs(
                env_parse("RECIPIENT_SESSION_TTL_HOURS", 2u64) * 3600,
            ),
            magic_link_ttl: Duration::from_secs(env_parse("ADMIN_MAGICLINK_TTL_MIN", 15u64) * 60),
            admin_session_ttl: Duration::from_secs(
                env_parse("AUTH_SESSION_TTL_HOURS", 12u64) * 3600,
            ),
            cookie_secure: env_flag("AUTH_COOKIE_SECURE"),
            allow_dev_auth: env_flag("ALLOW_DEV_AUTH"),
            device_code_ttl: Duration::from_secs(env_parse("DEVICE_CODE_TTL_MIN", 10u64) * 60),
            device_code_interval: Duration::from_secs(env_parse("DEVICE_CODE_INTERVAL_SEC", 5u64)),
            api_token_prefix: env_str("API_TOKEN_PREFIX", &defaults.api_token_prefix),
            api_token_ttl: std::env::var("API_TOKEN_TTL_DAYS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(|days| Duration::from_secs(days * 86_400)),
            api_token_scopes_default: std::env::var("API_TOKEN_SCOPES_DEFAULT")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_owned())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.api_token_scopes_default),
            history_snapshot_interval: env_parse("HISTORY_SNAPSHOT_INTERVAL", 20),
            history_max_chain_depth: env_parse("HISTORY_MAX_CHAIN_DEPTH", 200),
            system_user_id: env_str("SYSTEM_USER_ID", &defaults.system_user_id),
            plugin_action_concurrency: env_parse("PLUGIN_ACTION_CONCURRENCY", 10),
            bundle_rebuild_debounce: Duration::from_millis(env_parse(
                "BUNDLE_REBUILD_DEBOUNCE_MS",
                500u64,
            )),
            public_base_url: env_str("PUBLIC_BASE_URL", &format!("http://localhost:{port}")),
            email_from: env_str("SMTP_FROM", &defaults.email_from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = LatchflowConfig::default();
        assert_eq!(cfg.admin_session_cookie, "lf_admin_sess");
        assert_eq!(cfg.recipient_session_cookie, "lf_recipient_sess");
        assert_eq!(cfg.recipient_otp_length, 6);
        assert_eq!(cfg.recipient_otp_ttl, Duration::from_secs(600));
        assert_eq!(cfg.recipient_session_ttl, Duration::from_secs(7200));
        assert_eq!(cfg.magic_link_ttl, Duration::from_secs(900));
        assert_eq!(cfg.admin_session_ttl, Duration::from_secs(43_200));
        assert_eq!(cfg.api_token_prefix, "lfk_");
        assert_eq!(cfg.history_snapshot_interval, 20);
        assert_eq!(cfg.history_max_chain_depth, 200);
        assert_eq!(cfg.plugin_action_concurrency, 10);
    }
}
