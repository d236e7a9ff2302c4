//! Runtime audit: one entry per phase of every trigger emit and action
//! execution attempt.
//!
//! Sinks must never fail the operation they observe; implementations absorb
//! their own errors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use latchflow_core::{InvocationId, TriggerDefId, TriggerEventId};

use crate::service_error::ServiceErrorKind;

/// Lifecycle phase of an audited runtime operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditPhase {
    Started,
    Succeeded,
    Retry,
    Failed,
}

/// Audit entry for a trigger emit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerAuditEntry {
    pub definition_id: TriggerDefId,
    pub plugin_name: String,
    pub capability_key: String,
    pub phase: AuditPhase,
    /// Set on `Succeeded`: the persisted event id.
    pub trigger_event_id: Option<TriggerEventId>,
    /// Set on `Failed`.
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

/// Audit entry for one action execution phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionAuditEntry {
    pub invocation_id: InvocationId,
    pub plugin_name: String,
    pub capability_key: String,
    pub phase: AuditPhase,
    pub attempt: u32,
    pub error_code: Option<String>,
    pub error_kind: Option<ServiceErrorKind>,
    pub retry_delay_ms: Option<u64>,
    pub at: DateTime<Utc>,
}

/// Destination for runtime audit entries.
#[async_trait]
pub trait RuntimeAuditSink: Send + Sync {
    async fn record_trigger(&self, entry: TriggerAuditEntry);
    async fn record_action(&self, entry: ActionAuditEntry);
}

/// Sink that emits structured tracing events.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl RuntimeAuditSink for TracingAuditSink {
    async fn record_trigger(&self, entry: TriggerAuditEntry) {
        info!(
            target: "plugin_audit",
            definition = %entry.definition_id,
            plugin = %entry.plugin_name,
            capability = %entry.capability_key,
            phase = ?entry.phase,
            event = entry.trigger_event_id.as_ref().map(ToString::to_string),
            message = entry.message,
            "trigger audit"
        );
    }

    async fn record_action(&self, entry: ActionAuditEntry) {
        info!(
            target: "plugin_audit",
            invocation = %entry.invocation_id,
            plugin = %entry.plugin_name,
            capability = %entry.capability_key,
            phase = ?entry.phase,
            attempt = entry.attempt,
            error_code = entry.error_code,
            error_kind = ?entry.error_kind,
            retry_delay_ms = entry.retry_delay_ms,
            "action audit"
        );
    }
}

/// In-memory sink for test assertions.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    triggers: Mutex<Vec<TriggerAuditEntry>>,
    actions: Mutex<Vec<ActionAuditEntry>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn trigger_entries(&self) -> Vec<TriggerAuditEntry> {
        self.triggers.lock().clone()
    }

    #[must_use]
    pub fn action_entries(&self) -> Vec<ActionAuditEntry> {
        self.actions.lock().clone()
    }
}

#[async_trait]
impl RuntimeAuditSink for MemoryAuditSink {
    async fn record_trigger(&self, entry: TriggerAuditEntry) {
        self.triggers.lock().push(entry);
    }

    async fn record_action(&self, entry: ActionAuditEntry) {
        self.actions.lock().push(entry);
    }
}
