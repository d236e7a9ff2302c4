use serde::{Deserialize, Serialize};

use latchflow_core::{ActionDefId, TriggerEventId, UserId};

/// One unit of action work.
///
/// Exactly one of `trigger_event_id` (pipeline fan-out) or
/// `manual_invoker_id` (admin-initiated run) is set. `attempt` starts at 1;
/// retries re-enqueue a copy with `attempt + 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionMessage {
    pub action_definition_id: ActionDefId,
    #[serde(default)]
    pub trigger_event_id: Option<TriggerEventId>,
    #[serde(default)]
    pub manual_invoker_id: Option<UserId>,
    /// Context captured from the trigger firing, passed through to the plugin.
    #[serde(default)]
    pub context: Option<serde_json::Value>,
    #[serde(default = "first_attempt")]
    pub attempt: u32,
}

fn first_attempt() -> u32 {
    1
}

impl ActionMessage {
    /// A first-attempt message originating from a trigger event.
    #[must_use]
    pub fn from_trigger(
        action_definition_id: ActionDefId,
        trigger_event_id: TriggerEventId,
        context: Option<serde_json::Value>,
    ) -> Self {
        Self {
            action_definition_id,
            trigger_event_id: Some(trigger_event_id),
            manual_invoker_id: None,
            context,
            attempt: 1,
        }
    }

    /// A first-attempt message initiated manually by an admin.
    #[must_use]
    pub fn manual(
        action_definition_id: ActionDefId,
        invoker: UserId,
        context: Option<serde_json::Value>,
    ) -> Self {
        Self {
            action_definition_id,
            trigger_event_id: None,
            manual_invoker_id: Some(invoker),
            context,
            attempt: 1,
        }
    }

    /// The follow-up message for a retry of this attempt.
    #[must_use]
    pub fn next_attempt(&self) -> Self {
        let mut next = self.clone();
        next.attempt = self.attempt + 1;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_defaults_to_one_when_absent() {
        let msg: ActionMessage =
            serde_json::from_str(r#"{"action_definition_id":"a-1"}"#).unwrap();
        assert_eq!(msg.attempt, 1);
        assert!(msg.trigger_event_id.is_none());
    }

    #[test]
    fn next_attempt_increments() {
        let msg = ActionMessage::from_trigger(
            ActionDefId::new("a-1"),
            TriggerEventId::new("ev-1"),
            None,
        );
        let retry = msg.next_attempt();
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.action_definition_id, msg.action_definition_id);
    }
}
