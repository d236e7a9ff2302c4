use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{error, instrument, warn};

use latchflow_core::InvocationStatus;
use latchflow_crypto::ConfigCipher;
use latchflow_plugin::{
    ActionAuditEntry, ActionError, ActionInput, AuditPhase, ExecuteResult, InvocationInfo,
    PluginRegistry, PluginServiceError, RuntimeAuditSink, RuntimeContext, ServiceErrorKind,
};
use latchflow_queue::{ActionHandler, ActionMessage, QueueDriver, QueueError};
use latchflow_store::{InvocationOutcome, LatchflowStore, NewInvocation};

use crate::config::{ConsumerConfig, backoff_delay_ms};

/// How one execution resolved, before it is written to the row.
enum Disposition {
    Success(serde_json::Value),
    Retry {
        delay_ms: u64,
        detail: serde_json::Value,
    },
    FailedPermanent(serde_json::Value),
    Failed(serde_json::Value),
}

/// Background consumer of action messages.
pub struct ActionConsumer {
    store: Arc<dyn LatchflowStore>,
    registry: Arc<PluginRegistry>,
    cipher: Arc<ConfigCipher>,
    audit: Arc<dyn RuntimeAuditSink>,
    queue: Arc<dyn QueueDriver>,
    config: ConsumerConfig,
    slots: Arc<Semaphore>,
    retries: TaskTracker,
}

impl ActionConsumer {
    pub fn new(
        store: Arc<dyn LatchflowStore>,
        registry: Arc<PluginRegistry>,
        cipher: Arc<ConfigCipher>,
        audit: Arc<dyn RuntimeAuditSink>,
        queue: Arc<dyn QueueDriver>,
        config: ConsumerConfig,
    ) -> Arc<Self> {
        let slots = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Arc::new(Self {
            store,
            registry,
            cipher,
            audit,
            queue,
            config,
            slots,
            retries: TaskTracker::new(),
        })
    }

    /// Attach this consumer to the queue.
    pub async fn attach(self: &Arc<Self>) -> Result<(), QueueError> {
        let handler: Arc<dyn ActionHandler> = self.clone();
        self.queue.consume_actions(handler).await
    }

    /// Stop accepting retry timers and wait for scheduled retries to flush.
    pub async fn shutdown(&self) {
        self.retries.close();
        self.retries.wait().await;
    }

    /// Process one message end to end. Never propagates an error into the
    /// queue loop -- every failure lands in the invocation row and audit.
    #[instrument(skip(self, msg), fields(action = %msg.action_definition_id, attempt = msg.attempt))]
    async fn process(&self, msg: ActionMessage) {
        // 1. Materialize the PENDING row. Without it there is nothing to
        //    finalize, so the message goes back to the queue layer.
        let invocation = match self
            .store
            .create_invocation(NewInvocation {
                action_definition_id: msg.action_definition_id.clone(),
                trigger_event_id: msg.trigger_event_id.clone(),
                manual_invoker_id: msg.manual_invoker_id.clone(),
                attempt: msg.attempt,
            })
            .await
        {
            Ok(row) => row,
            Err(e) => {
                error!(error = %e, "invocation create failed, leaving message to queue retry");
                return;
            }
        };

        // 2. Resolve the definition; missing or disabled short-circuits.
        let definition = match self.store.action_definition(&msg.action_definition_id).await {
            Ok(Some(def)) if def.is_enabled => def,
            Ok(_) => {
                self.finalize(
                    &invocation.id,
                    InvocationStatus::SkippedDisabled,
                    Some(serde_json::json!({"reason": "ACTION_DISABLED"})),
                    None,
                )
                .await;
                return;
            }
            Err(e) => {
                self.finalize(
                    &invocation.id,
                    InvocationStatus::Failed,
                    Some(serde_json::json!({"error": {"message": e.to_string()}})),
                    None,
                )
                .await;
                return;
            }
        };

        // 3. Resolve the capability; capture identity for audit.
        let cap_ref = match self.registry.require_action_by_id(&definition.capability_id) {
            Ok(cap_ref) => cap_ref,
            Err(e) => {
                self.finalize(
                    &invocation.id,
                    InvocationStatus::FailedPermanent,
                    Some(serde_json::json!({"error": {"code": "CAPABILITY_NOT_FOUND", "message": e.to_string()}})),
                    None,
                )
                .await;
                return;
            }
        };
        let plugin_name = cap_ref.plugin_name.clone();
        let capability_key = cap_ref.capability.key.clone();

        let config = match self.cipher.decrypt(&definition.config) {
            Ok(config) => config,
            Err(e) => {
                self.finalize(
                    &invocation.id,
                    InvocationStatus::FailedPermanent,
                    Some(serde_json::json!({"error": {"code": "CONFIG_DECRYPT_FAILED", "message": e.to_string()}})),
                    None,
                )
                .await;
                return;
            }
        };

        // 4. Concurrency slot. The permit is dropped on every exit path,
        //    releasing the slot exactly once.
        let permit = match self.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_closed) => return,
        };

        self.record_audit(
            &invocation.id,
            &plugin_name,
            &capability_key,
            AuditPhase::Started,
            msg.attempt,
            None,
            None,
            None,
        )
        .await;

        // 5. Instantiate and execute under the timeout budget.
        let ctx = RuntimeContext {
            definition_id: definition.id.to_string(),
            capability: cap_ref.capability.clone(),
            plugin_name: plugin_name.clone(),
            config: config.clone(),
            secrets: None,
            services: self.registry.create_runtime_services(&cap_ref),
        };
        let outcome = match self.registry.instantiate_action(&cap_ref, ctx) {
            Ok(runtime) => {
                let input = ActionInput {
                    config,
                    secrets: None,
                    payload: msg.context.clone(),
                    invocation: InvocationInfo {
                        id: invocation.id.clone(),
                        action_definition_id: definition.id.clone(),
                        trigger_event_id: msg.trigger_event_id.clone(),
                        manual_invoker_id: msg.manual_invoker_id.clone(),
                        attempt: msg.attempt,
                    },
                };

                let executed =
                    tokio::time::timeout(self.config.execution_timeout, runtime.execute(input))
                        .await
                        .unwrap_or_else(|_elapsed| {
                            Err(ActionError::Service(
                                PluginServiceError::fatal(
                                    "ACTION_TIMEOUT",
                                    format!(
                                        "action execution timed out after {}s",
                                        self.config.execution_timeout.as_secs()
                                    ),
                                ),
                            ))
                        });

                // 6. Dispose, tolerating failures.
                if let Err(e) = runtime.dispose().await {
                    warn!(invocation = %invocation.id, error = %e, "action dispose failed");
                }

                executed
            }
            Err(e) => Err(ActionError::Service(PluginServiceError::fatal(
                "INVALID_RUNTIME",
                e.to_string(),
            ))),
        };

        // 7. Classify and finalize.
        let disposition = self.classify(outcome, msg.attempt);
        match disposition {
            Disposition::Success(result) => {
                self.finalize(&invocation.id, InvocationStatus::Success, Some(result), None)
                    .await;
                self.record_audit(
                    &invocation.id,
                    &plugin_name,
                    &capability_key,
                    AuditPhase::Succeeded,
                    msg.attempt,
                    None,
                    None,
                    None,
                )
                .await;
            }
            Disposition::Retry { delay_ms, detail } => {
                let retry_at = Utc::now() + chrono::Duration::milliseconds(delay_ms as i64);
                self.finalize(
                    &invocation.id,
                    InvocationStatus::Retrying,
                    Some(detail.clone()),
                    Some(retry_at),
                )
                .await;
                self.record_audit(
                    &invocation.id,
                    &plugin_name,
                    &capability_key,
                    AuditPhase::Retry,
                    msg.attempt,
                    detail
                        .pointer("/error/code")
                        .and_then(|v| v.as_str())
                        .map(str::to_owned),
                    detail_kind(&detail),
                    Some(delay_ms),
                )
                .await;
                self.schedule_retry(msg.next_attempt(), delay_ms);
            }
            Disposition::FailedPermanent(detail) => {
                self.finalize(
                    &invocation.id,
                    InvocationStatus::FailedPermanent,
                    Some(detail.clone()),
                    None,
                )
                .await;
                self.record_audit(
                    &invocation.id,
                    &plugin_name,
                    &capability_key,
                    AuditPhase::Failed,
                    msg.attempt,
                    detail
                        .pointer("/error/code")
                        .and_then(|v| v.as_str())
                        .map(str::to_owned),
                    detail_kind(&detail),
                    None,
                )
                .await;
            }
            Disposition::Failed(detail) => {
                self.finalize(&invocation.id, InvocationStatus::Failed, Some(detail.clone()), None)
                    .await;
                self.record_audit(
                    &invocation.id,
                    &plugin_name,
                    &capability_key,
                    AuditPhase::Failed,
                    msg.attempt,
                    detail
                        .pointer("/error/code")
                        .and_then(|v| v.as_str())
                        .map(str::to_owned),
                    None,
                    None,
                )
                .await;
            }
        }

        drop(permit);
    }

    fn classify(
        &self,
        outcome: Result<ExecuteResult, ActionError>,
        attempt: u32,
    ) -> Disposition {
        match outcome {
            Ok(ExecuteResult::Completed(value)) => Disposition::Success(value),
            Ok(ExecuteResult::Retry { delay_ms }) => {
                let delay_ms = delay_ms.unwrap_or_else(|| backoff_delay_ms(&self.config, attempt));
                Disposition::Retry {
                    delay_ms,
                    detail: serde_json::json!({"retry": {"delay_ms": delay_ms}}),
                }
            }
            Err(ActionError::Service(e)) => {
                let detail = serde_json::json!({
                    "error": {
                        "code": e.code,
                        "message": e.message,
                        "kind": e.kind,
                    }
                });
                match e.kind {
                    ServiceErrorKind::Retryable | ServiceErrorKind::RateLimit => {
                        let delay_ms = e
                            .retry_delay_ms
                            .unwrap_or_else(|| backoff_delay_ms(&self.config, attempt));
                        Disposition::Retry { delay_ms, detail }
                    }
                    ServiceErrorKind::Validation
                    | ServiceErrorKind::Permission
                    | ServiceErrorKind::Fatal => Disposition::FailedPermanent(detail),
                }
            }
            Err(ActionError::Internal(message)) => {
                Disposition::Failed(serde_json::json!({"error": {"message": message}}))
            }
        }
    }

    /// Write the single finalizing update; a failure here is logged, never
    /// propagated into the queue loop.
    async fn finalize(
        &self,
        id: &latchflow_core::InvocationId,
        status: InvocationStatus,
        result: Option<serde_json::Value>,
        retry_at: Option<chrono::DateTime<Utc>>,
    ) {
        if let Err(e) = self
            .store
            .finalize_invocation(
                id,
                InvocationOutcome {
                    status,
                    result,
                    retry_at,
                },
            )
            .await
        {
            error!(invocation = %id, ?status, error = %e, "invocation finalize failed");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_audit(
        &self,
        invocation_id: &latchflow_core::InvocationId,
        plugin_name: &str,
        capability_key: &str,
        phase: AuditPhase,
        attempt: u32,
        error_code: Option<String>,
        error_kind: Option<ServiceErrorKind>,
        retry_delay_ms: Option<u64>,
    ) {
        self.audit
            .record_action(ActionAuditEntry {
                invocation_id: invocation_id.clone(),
                plugin_name: plugin_name.to_owned(),
                capability_key: capability_key.to_owned(),
                phase,
                attempt,
                error_code,
                error_kind,
                retry_delay_ms,
                at: Utc::now(),
            })
            .await;
    }

    /// Re-enqueue `msg` after `delay_ms`. A persisted `retry_at` plus a
    /// poller would honor the same contract; the in-process timer is the
    /// single-node rendition.
    fn schedule_retry(&self, msg: ActionMessage, delay_ms: u64) {
        let queue = self.queue.clone();
        self.retries.spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            if let Err(e) = queue.enqueue_action(msg).await {
                error!(error = %e, "retry enqueue failed");
            }
        });
    }
}

fn detail_kind(detail: &serde_json::Value) -> Option<ServiceErrorKind> {
    detail
        .pointer("/error/kind")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
}

#[async_trait]
impl ActionHandler for ActionConsumer {
    async fn handle(&self, msg: ActionMessage) {
        self.process(msg).await;
    }
}
