use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{TriggerDefId, TriggerEventId};

/// Immutable, append-only record of one logical trigger firing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub id: TriggerEventId,
    pub trigger_definition_id: TriggerDefId,
    /// Context supplied by the firing trigger, if any.
    pub context: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}
