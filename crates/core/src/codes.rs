//! Stable error-code strings of the HTTP error contract.
//!
//! Responses use the shape `{"status":"error","code":...,"message":...}`; the
//! codes below are the machine-readable vocabulary clients switch on.

pub const BAD_REQUEST: &str = "BAD_REQUEST";
pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
pub const FORBIDDEN: &str = "FORBIDDEN";
pub const NOT_FOUND: &str = "NOT_FOUND";
pub const CONFLICT: &str = "CONFLICT";
pub const IN_USE: &str = "IN_USE";
pub const NO_STORAGE_PATH: &str = "NO_STORAGE_PATH";
pub const MAX_DOWNLOADS_EXCEEDED: &str = "MAX_DOWNLOADS_EXCEEDED";
pub const COOLDOWN_ACTIVE: &str = "COOLDOWN_ACTIVE";
pub const RATE_LIMITED: &str = "RATE_LIMITED";
pub const SLOW_DOWN: &str = "SLOW_DOWN";
pub const EXPIRED: &str = "EXPIRED";
pub const REVOKED: &str = "REVOKED";
pub const UNAVAILABLE: &str = "UNAVAILABLE";
pub const INVALID_CODE: &str = "INVALID_CODE";
pub const NOT_IMPLEMENTED: &str = "NOT_IMPLEMENTED";
pub const STREAM_ERROR: &str = "STREAM_ERROR";
pub const ACTION_TIMEOUT: &str = "ACTION_TIMEOUT";
pub const ACTION_DISABLED: &str = "ACTION_DISABLED";
pub const CAPABILITY_NOT_FOUND: &str = "CAPABILITY_NOT_FOUND";
pub const INVALID_RUNTIME: &str = "INVALID_RUNTIME";
