use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a plugin service failure.
///
/// The kind drives the `ActionInvocation` terminal status:
/// `Retryable`/`RateLimit` → `RETRYING`, `Validation`/`Permission`/`Fatal`
/// → `FAILED_PERMANENT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceErrorKind {
    Validation,
    Permission,
    Fatal,
    Retryable,
    RateLimit,
}

/// A typed failure raised by plugin code or the runtime around it.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct PluginServiceError {
    pub kind: ServiceErrorKind,
    /// Stable machine-readable code, e.g. `ACTION_TIMEOUT`.
    pub code: String,
    pub message: String,
    /// Explicit retry delay for `Retryable`/`RateLimit` failures.
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
}

impl PluginServiceError {
    #[must_use]
    pub fn new(kind: ServiceErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            retry_delay_ms: None,
        }
    }

    /// A fatal failure, never retried.
    #[must_use]
    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Fatal, code, message)
    }

    /// A retryable failure, optionally with an explicit delay.
    #[must_use]
    pub fn retryable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Retryable, code, message)
    }

    #[must_use]
    pub fn with_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.retry_delay_ms = Some(delay_ms);
        self
    }
}

/// What an action execution can fail with.
///
/// `Service` failures carry a classification; anything else is an `Internal`
/// failure that finalizes the invocation as `FAILED` (retry-neutral).
#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    Service(#[from] PluginServiceError),

    #[error("internal action error: {0}")]
    Internal(String),
}
