use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ActionDefId, InvocationId, UserId};

/// What kind of mutation a change-log row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    UpdateParent,
    UpdateChild,
    AddChild,
    RemoveChild,
}

/// Who performed a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActorType {
    User,
    Action,
    System,
}

/// Attribution for a change-log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorRef {
    pub actor_type: ActorType,
    pub actor_user_id: Option<UserId>,
    /// Set when an action invocation performed the mutation.
    pub actor_invocation_id: Option<InvocationId>,
    pub actor_action_definition_id: Option<ActionDefId>,
    pub on_behalf_of_user_id: Option<UserId>,
}

impl ActorRef {
    /// Attribution for a direct admin mutation.
    #[must_use]
    pub fn user(id: UserId) -> Self {
        Self {
            actor_type: ActorType::User,
            actor_user_id: Some(id),
            actor_invocation_id: None,
            actor_action_definition_id: None,
            on_behalf_of_user_id: None,
        }
    }

    /// Attribution for a system-initiated mutation (e.g. a scheduled rebuild).
    #[must_use]
    pub fn system() -> Self {
        Self {
            actor_type: ActorType::System,
            actor_user_id: None,
            actor_invocation_id: None,
            actor_action_definition_id: None,
            on_behalf_of_user_id: None,
        }
    }
}

/// One version of an entity's history.
///
/// Rows are append-only and outlive every mutation of the entity. A snapshot
/// row stores the full entity state; a delta row stores a JSON patch against
/// the previous version. Versions are monotone per entity, starting at 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeLogRow {
    pub id: String,
    /// Entity table name, e.g. `"bundle"` or `"trigger_definition"`.
    pub entity_type: String,
    pub entity_id: String,
    pub version: u64,
    pub is_snapshot: bool,
    /// Full state (snapshot) or JSON patch against version − 1 (delta).
    pub state: serde_json::Value,
    /// SHA-256 hex of the canonical serialized state at this version.
    pub hash: String,
    pub change_note: Option<String>,
    /// JSON-pointer-ish path of the changed child, when applicable.
    pub changed_path: Option<String>,
    pub change_kind: ChangeKind,
    #[serde(flatten)]
    pub actor: ActorRef,
    pub created_at: DateTime<Utc>,
}
