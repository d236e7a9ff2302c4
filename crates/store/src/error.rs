use thiserror::Error;

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The addressed row does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A uniqueness constraint was violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Deletion refused because dependent rows exist. Cascading deletion is
    /// forbidden across the model.
    #[error("{entity} {id} is in use by {dependents}")]
    InUse {
        entity: &'static str,
        id: String,
        dependents: &'static str,
    },

    /// A single-use credential was already consumed.
    #[error("{0} already consumed")]
    Consumed(&'static str),

    /// A time-limited credential is past its expiry.
    #[error("{0} expired")]
    Expired(&'static str),

    /// Change-log materialization walked past the configured chain depth.
    #[error("history chain for {entity_type}/{entity_id} exceeds depth {max}")]
    ChainTooDeep {
        entity_type: String,
        entity_id: String,
        max: u32,
    },

    /// The requested history version does not exist.
    #[error("no version {version} for {entity_type}/{entity_id}")]
    VersionNotFound {
        entity_type: String,
        entity_id: String,
        version: u64,
    },

    /// A backend error occurred.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
}
