use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ActionDefId, PipelineId, TriggerDefId};

/// An ordered sequence of actions attached to one or more triggers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: PipelineId,
    pub name: String,
    pub description: Option<String>,
    pub is_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One action slot within a pipeline, ordered by `sort_order`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStep {
    pub id: String,
    pub pipeline_id: PipelineId,
    pub action_id: ActionDefId,
    pub sort_order: i32,
    pub is_enabled: bool,
}

/// Attachment of a pipeline to a trigger definition.
///
/// `sort_order` orders fan-out across pipelines attached to the same trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineTrigger {
    pub id: String,
    pub pipeline_id: PipelineId,
    pub trigger_id: TriggerDefId,
    pub sort_order: i32,
    pub is_enabled: bool,
}

/// One fan-out target resolved from a trigger firing: an enabled step of an
/// enabled pipeline attached to the fired trigger, with its enabled action.
///
/// Ordering is `(pipeline_trigger.sort_order, step.sort_order)`, each
/// tie-broken by id, and is the order messages are enqueued in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedStep {
    pub pipeline_id: PipelineId,
    pub step_id: String,
    pub action_definition_id: ActionDefId,
}
