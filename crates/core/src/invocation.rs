use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ActionDefId, InvocationId, TriggerEventId, UserId};

/// Status of one attempt to execute an action.
///
/// `Pending` is the only non-terminal state. `Retrying` is terminal for the
/// current row: a retry produces a *new* invocation row rather than re-running
/// this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvocationStatus {
    Pending,
    Success,
    Retrying,
    Failed,
    FailedPermanent,
    SkippedDisabled,
}

impl InvocationStatus {
    /// Whether this status finalizes the invocation row.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// One row per attempt to execute an action.
///
/// Exactly one of `trigger_event_id` (pipeline fan-out) or
/// `manual_invoker_id` (admin-initiated run) identifies the origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionInvocation {
    pub id: InvocationId,
    pub action_definition_id: ActionDefId,
    pub trigger_event_id: Option<TriggerEventId>,
    pub manual_invoker_id: Option<UserId>,
    pub status: InvocationStatus,
    /// Attempt number, starting at 1. Retries carry `attempt + 1` into a new row.
    pub attempt: u32,
    pub result: Option<serde_json::Value>,
    /// Earliest time a retry may be enqueued, when `status == Retrying`.
    pub retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_is_the_only_non_terminal_status() {
        assert!(!InvocationStatus::Pending.is_terminal());
        for status in [
            InvocationStatus::Success,
            InvocationStatus::Retrying,
            InvocationStatus::Failed,
            InvocationStatus::FailedPermanent,
            InvocationStatus::SkippedDisabled,
        ] {
            assert!(status.is_terminal(), "{status:?} should be terminal");
        }
    }

    #[test]
    fn status_serde_is_screaming_snake() {
        let json = serde_json::to_string(&InvocationStatus::FailedPermanent).unwrap();
        assert_eq!(json, "\"FAILED_PERMANENT\"");
        let back: InvocationStatus = serde_json::from_str("\"SKIPPED_DISABLED\"").unwrap();
        assert_eq!(back, InvocationStatus::SkippedDisabled);
    }
}
