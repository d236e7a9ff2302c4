use std::sync::Arc;

use tracing::{instrument, warn};

use latchflow_core::{TriggerDefId, TriggerEventId};
use latchflow_plugin::TriggerPayload;
use latchflow_queue::{ActionMessage, QueueDriver};
use latchflow_store::LatchflowStore;
use latchflow_store::NewTriggerEvent;

use crate::error::TriggerError;

/// Turns one trigger firing into a persisted event plus enqueued action
/// messages.
pub struct TriggerRunner {
    store: Arc<dyn LatchflowStore>,
    queue: Arc<dyn QueueDriver>,
}

impl TriggerRunner {
    pub fn new(store: Arc<dyn LatchflowStore>, queue: Arc<dyn QueueDriver>) -> Self {
        Self { store, queue }
    }

    /// Persist a `TriggerEvent` for this firing and fan out to every enabled
    /// step of every enabled pipeline attached to the trigger.
    ///
    /// The event is persisted before any enqueue, and enqueue failures do
    /// not roll back prior enqueues -- the event remains as evidence of the
    /// firing either way. Steps of one pipeline are enqueued in
    /// `sort_order`; across pipelines, attachment `sort_order` rules.
    #[instrument(skip(self, payload), fields(trigger = %trigger_definition_id))]
    pub async fn fire_trigger_once(
        &self,
        trigger_definition_id: &TriggerDefId,
        payload: TriggerPayload,
    ) -> Result<TriggerEventId, TriggerError> {
        let event = self
            .store
            .record_trigger_event(NewTriggerEvent {
                trigger_definition_id: trigger_definition_id.clone(),
                context: payload.context,
            })
            .await?;

        let steps = self.store.resolve_fanout(trigger_definition_id).await?;
        for step in steps {
            let msg = ActionMessage::from_trigger(
                step.action_definition_id.clone(),
                event.id.clone(),
                event.context.clone(),
            );
            if let Err(e) = self.queue.enqueue_action(msg).await {
                warn!(
                    action = %step.action_definition_id,
                    event = %event.id,
                    error = %e,
                    "enqueue failed, continuing fan-out"
                );
            }
        }

        Ok(event.id)
    }
}
