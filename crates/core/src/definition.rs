use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ActionDefId, CapabilityId, TriggerDefId, UserId};

/// Persisted configuration that parameterizes a trigger capability.
///
/// `config` is opaque JSON, possibly an encrypted envelope; only the owning
/// plugin decodes its schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDefinition {
    pub id: TriggerDefId,
    pub capability_id: CapabilityId,
    pub name: String,
    pub config: serde_json::Value,
    pub is_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: UserId,
    pub updated_by: UserId,
}

/// Persisted configuration that parameterizes an action capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub id: ActionDefId,
    pub capability_id: CapabilityId,
    pub name: String,
    pub config: serde_json::Value,
    pub is_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: UserId,
    pub updated_by: UserId,
}
