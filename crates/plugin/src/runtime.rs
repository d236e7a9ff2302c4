use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use latchflow_core::{
    ActionDefId, InvocationId, PluginCapability, TriggerEventId, UserId,
};

use crate::service_error::{ActionError, PluginServiceError};

/// Payload a trigger runtime hands to `emit` when it fires.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerPayload {
    /// Context captured into the `TriggerEvent` and fanned out to actions.
    #[serde(default)]
    pub context: Option<serde_json::Value>,
    /// Trigger-internal metadata, not persisted into the event.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    /// For schedule-style triggers, the instant this firing represents.
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
}

/// Closure a trigger runtime calls to fire. Forwards to the trigger
/// manager's `fire_trigger`, returning the persisted event id.
pub type EmitFn = Arc<
    dyn Fn(TriggerPayload) -> BoxFuture<'static, Result<TriggerEventId, PluginServiceError>>
        + Send
        + Sync,
>;

/// Per-invocation services handed to plugin runtimes.
#[derive(Clone)]
pub struct RuntimeServices {
    /// Tracing target runtimes log under, e.g. `"plugin::cron"`.
    pub log_target: String,
    emit: Option<EmitFn>,
}

impl RuntimeServices {
    /// Services for an action runtime (no emit).
    #[must_use]
    pub fn new(log_target: impl Into<String>) -> Self {
        Self {
            log_target: log_target.into(),
            emit: None,
        }
    }

    /// Services for a trigger runtime, wired with its emit closure.
    #[must_use]
    pub fn with_emit(log_target: impl Into<String>, emit: EmitFn) -> Self {
        Self {
            log_target: log_target.into(),
            emit: Some(emit),
        }
    }

    /// Fire the owning trigger. Only trigger services carry an emitter.
    pub async fn emit(
        &self,
        payload: TriggerPayload,
    ) -> Result<TriggerEventId, PluginServiceError> {
        match &self.emit {
            Some(emit) => emit(payload).await,
            None => Err(PluginServiceError::fatal(
                "EMIT_UNAVAILABLE",
                "emit is only available to trigger runtimes",
            )),
        }
    }
}

impl std::fmt::Debug for RuntimeServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeServices")
            .field("log_target", &self.log_target)
            .field("has_emit", &self.emit.is_some())
            .finish()
    }
}

/// Everything a factory gets to construct a runtime for one definition.
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    /// The trigger or action definition id this runtime serves.
    pub definition_id: String,
    pub capability: PluginCapability,
    pub plugin_name: String,
    /// Decrypted definition config.
    pub config: serde_json::Value,
    /// Reserved for a future secret-mounting mechanism; always `None`.
    pub secrets: Option<serde_json::Value>,
    pub services: RuntimeServices,
}

/// A long-lived trigger runtime managed by the trigger manager.
#[async_trait]
pub trait TriggerRuntime: Send + Sync {
    /// Begin watching/scheduling. Returns once the runtime is armed.
    async fn start(&self) -> Result<(), PluginServiceError>;

    /// Stop firing. Must be idempotent.
    async fn stop(&self) -> Result<(), PluginServiceError>;

    /// Whether the runtime can absorb config changes without a restart.
    fn supports_config_change(&self) -> bool {
        false
    }

    /// Apply a new decrypted config in place. Only called when
    /// [`supports_config_change`](Self::supports_config_change) is `true`.
    async fn on_config_change(
        &self,
        _config: &serde_json::Value,
    ) -> Result<(), PluginServiceError> {
        Ok(())
    }

    /// Release resources after stop. Errors are logged, never propagated.
    async fn dispose(&self) -> Result<(), PluginServiceError> {
        Ok(())
    }
}

/// Identity of the invocation an action executes under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationInfo {
    pub id: InvocationId,
    pub action_definition_id: ActionDefId,
    pub trigger_event_id: Option<TriggerEventId>,
    pub manual_invoker_id: Option<UserId>,
    pub attempt: u32,
}

/// Input to one action execution.
#[derive(Debug, Clone)]
pub struct ActionInput {
    /// Decrypted definition config.
    pub config: serde_json::Value,
    /// Reserved; always `None`.
    pub secrets: Option<serde_json::Value>,
    /// Context from the originating trigger event or manual invocation.
    pub payload: Option<serde_json::Value>,
    pub invocation: InvocationInfo,
}

/// What a successful (non-thrown) action execution resolves to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecuteResult {
    /// The action completed; the value is stored as the invocation result.
    Completed(serde_json::Value),
    /// The action asks to be retried. `delay_ms` overrides the backoff.
    Retry { delay_ms: Option<u64> },
}

/// A single-shot action runtime, constructed per invocation.
#[async_trait]
pub trait ActionRuntime: Send + Sync {
    async fn execute(&self, input: ActionInput) -> Result<ExecuteResult, ActionError>;

    /// Release resources after execution. Errors are logged, never propagated.
    async fn dispose(&self) -> Result<(), PluginServiceError> {
        Ok(())
    }
}

/// What a factory produces: one of the two runtime variants.
pub enum RuntimeHandle {
    Trigger(Box<dyn TriggerRuntime>),
    Action(Box<dyn ActionRuntime>),
}

impl RuntimeHandle {
    pub(crate) fn variant_name(&self) -> &'static str {
        match self {
            Self::Trigger(_) => "trigger",
            Self::Action(_) => "action",
        }
    }
}

/// Constructs a runtime from a context. Implemented for plain closures.
pub trait RuntimeFactory: Send + Sync {
    fn create(&self, ctx: RuntimeContext) -> Result<RuntimeHandle, PluginServiceError>;
}

impl<F> RuntimeFactory for F
where
    F: Fn(RuntimeContext) -> Result<RuntimeHandle, PluginServiceError> + Send + Sync,
{
    fn create(&self, ctx: RuntimeContext) -> Result<RuntimeHandle, PluginServiceError> {
        self(ctx)
    }
}
