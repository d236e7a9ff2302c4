//! In-memory reference implementation of the persistence contracts.
//!
//! All tables live behind one `parking_lot::RwLock`; critical sections are
//! short and never await. Change-log appends happen inside the same write
//! section as the mutation they describe, which is the memory-store
//! equivalent of "same transaction". Download admissions serialize on a
//! per-assignment `tokio::sync::Mutex`, the stand-in for row locking.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use latchflow_core::{
    ActionDefId, ActionDefinition, ActionInvocation, ActorRef, ApiToken, AssignmentId, Bundle,
    BundleAssignment, BundleId, BundleObject, ChangeKind, ChangeLogRow, DeviceAuth, DeviceAuthId,
    DownloadEvent, FileId, FileRecord, InvocationId, InvocationStatus, MagicLink, Pipeline,
    PipelineId, PipelineStep, PipelineTrigger, Recipient, RecipientId, RecipientOtp,
    RecipientSession, ResolvedStep, Session, TokenId, TriggerDefId, TriggerDefinition,
    TriggerEvent, TriggerEventId, User, UserId,
};
use latchflow_crypto::sha256_hex;

use crate::download::{DownloadTx, NewDownloadEvent};
use crate::error::StoreError;
use crate::history::{AppendChange, HistoryConfig};
use crate::traits::{
    AuthStore, BundlePointer, BundleStore, ChangeLogStore, DefinitionStore, FileStore,
    InvocationOutcome, NewInvocation, NewTriggerEvent, PipelineStore, RecipientStore, RunStore,
};

#[derive(Default)]
struct Tables {
    trigger_defs: HashMap<TriggerDefId, TriggerDefinition>,
    action_defs: HashMap<ActionDefId, ActionDefinition>,
    pipelines: HashMap<PipelineId, Pipeline>,
    steps: HashMap<String, PipelineStep>,
    attachments: HashMap<String, PipelineTrigger>,
    trigger_events: HashMap<TriggerEventId, TriggerEvent>,
    invocations: HashMap<InvocationId, ActionInvocation>,
    bundles: HashMap<BundleId, Bundle>,
    bundle_objects: HashMap<String, BundleObject>,
    files: HashMap<FileId, FileRecord>,
    recipients: HashMap<RecipientId, Recipient>,
    assignments: HashMap<AssignmentId, BundleAssignment>,
    download_events: Vec<DownloadEvent>,
    users: HashMap<UserId, User>,
    sessions: HashMap<String, Session>,
    magic_links: HashMap<String, MagicLink>,
    otps: HashMap<String, RecipientOtp>,
    recipient_sessions: HashMap<String, RecipientSession>,
    device_auths: HashMap<DeviceAuthId, DeviceAuth>,
    api_tokens: HashMap<TokenId, ApiToken>,
    changelog: HashMap<(String, String), Vec<ChangeLogRow>>,
    /// Current materialized state per entity, kept so delta computation
    /// never has to replay the chain.
    current_state: HashMap<(String, String), serde_json::Value>,
}

struct Inner {
    tables: RwLock<Tables>,
    /// Per-assignment admission locks, created lazily.
    assignment_locks: parking_lot::Mutex<HashMap<AssignmentId, Arc<Mutex<()>>>>,
    history: HistoryConfig,
}

/// Single-process reference store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_history(HistoryConfig::default())
    }

    #[must_use]
    pub fn with_history(history: HistoryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                tables: RwLock::new(Tables::default()),
                assignment_locks: parking_lot::Mutex::new(HashMap::new()),
                history,
            }),
        }
    }
}

fn new_row_id() -> String {
    Uuid::new_v4().to_string()
}

/// Append a change-log row while already holding the write lock.
fn append_locked(
    tables: &mut Tables,
    history: &HistoryConfig,
    change: AppendChange,
) -> Result<ChangeLogRow, StoreError> {
    let key = (change.entity_type.to_owned(), change.entity_id.clone());
    let version = tables.changelog.get(&key).map_or(0, Vec::len) as u64 + 1;
    let is_snapshot = history.is_snapshot_version(version);

    let stored_state = if is_snapshot {
        change.state.clone()
    } else {
        let prev = tables
            .current_state
            .get(&key)
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let patch = json_patch::diff(&prev, &change.state);
        serde_json::to_value(patch).map_err(|e| StoreError::Backend(e.to_string()))?
    };

    let canonical =
        serde_json::to_string(&change.state).map_err(|e| StoreError::Backend(e.to_string()))?;
    let row = ChangeLogRow {
        id: new_row_id(),
        entity_type: change.entity_type.to_owned(),
        entity_id: change.entity_id,
        version,
        is_snapshot,
        state: stored_state,
        hash: sha256_hex(canonical.as_bytes()),
        change_note: change.change_note,
        changed_path: change.changed_path,
        change_kind: change.change_kind,
        actor: change.actor,
        created_at: Utc::now(),
    };

    tables.current_state.insert(key.clone(), change.state);
    tables.changelog.entry(key).or_default().push(row.clone());
    Ok(row)
}

/// Composite history state for a bundle: the parent row plus its objects.
fn bundle_history_state(tables: &Tables, id: &BundleId) -> serde_json::Value {
    let bundle = tables.bundles.get(id);
    let mut objects: Vec<&BundleObject> = tables
        .bundle_objects
        .values()
        .filter(|o| &o.bundle_id == id)
        .collect();
    objects.sort_by(|a, b| a.id.cmp(&b.id));
    serde_json::json!({ "bundle": bundle, "objects": objects })
}

fn pipeline_history_state(tables: &Tables, id: &PipelineId) -> serde_json::Value {
    let pipeline = tables.pipelines.get(id);
    let mut steps: Vec<&PipelineStep> = tables
        .steps
        .values()
        .filter(|s| &s.pipeline_id == id)
        .collect();
    steps.sort_by(|a, b| a.id.cmp(&b.id));
    let mut triggers: Vec<&PipelineTrigger> = tables
        .attachments
        .values()
        .filter(|t| &t.pipeline_id == id)
        .collect();
    triggers.sort_by(|a, b| a.id.cmp(&b.id));
    serde_json::json!({ "pipeline": pipeline, "steps": steps, "triggers": triggers })
}

fn to_state<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Backend(e.to_string()))
}

#[async_trait]
impl DefinitionStore for MemoryStore {
    async fn trigger_definition(
        &self,
        id: &TriggerDefId,
    ) -> Result<Option<TriggerDefinition>, StoreError> {
        Ok(self.inner.tables.read().trigger_defs.get(id).cloned())
    }

    async fn list_trigger_definitions(&self) -> Result<Vec<TriggerDefinition>, StoreError> {
        let mut defs: Vec<_> = self.inner.tables.read().trigger_defs.values().cloned().collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(defs)
    }

    async fn enabled_trigger_definitions(&self) -> Result<Vec<TriggerDefinition>, StoreError> {
        let mut defs: Vec<_> = self
            .inner
            .tables
            .read()
            .trigger_defs
            .values()
            .filter(|d| d.is_enabled)
            .cloned()
            .collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(defs)
    }

    async fn create_trigger_definition(
        &self,
        def: TriggerDefinition,
        actor: &ActorRef,
    ) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        if tables.trigger_defs.contains_key(&def.id) {
            return Err(StoreError::Conflict(format!(
                "trigger definition {} exists",
                def.id
            )));
        }
        let state = to_state(&def)?;
        tables.trigger_defs.insert(def.id.clone(), def.clone());
        append_locked(
            &mut tables,
            &self.inner.history,
            AppendChange {
                entity_type: "trigger_definition",
                entity_id: def.id.to_string(),
                state,
                change_note: None,
                changed_path: None,
                change_kind: ChangeKind::UpdateParent,
                actor: actor.clone(),
            },
        )?;
        Ok(())
    }

    async fn update_trigger_definition(
        &self,
        def: TriggerDefinition,
        actor: &ActorRef,
    ) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        if !tables.trigger_defs.contains_key(&def.id) {
            return Err(StoreError::not_found("trigger definition", def.id.to_string()));
        }
        let state = to_state(&def)?;
        tables.trigger_defs.insert(def.id.clone(), def.clone());
        append_locked(
            &mut tables,
            &self.inner.history,
            AppendChange {
                entity_type: "trigger_definition",
                entity_id: def.id.to_string(),
                state,
                change_note: None,
                changed_path: None,
                change_kind: ChangeKind::UpdateParent,
                actor: actor.clone(),
            },
        )?;
        Ok(())
    }

    async fn delete_trigger_definition(&self, id: &TriggerDefId) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        if tables.attachments.values().any(|a| &a.trigger_id == id) {
            return Err(StoreError::InUse {
                entity: "trigger definition",
                id: id.to_string(),
                dependents: "pipeline triggers",
            });
        }
        if tables
            .trigger_events
            .values()
            .any(|e| &e.trigger_definition_id == id)
        {
            return Err(StoreError::InUse {
                entity: "trigger definition",
                id: id.to_string(),
                dependents: "trigger events",
            });
        }
        tables
            .trigger_defs
            .remove(id)
            .ok_or_else(|| StoreError::not_found("trigger definition", id.to_string()))?;
        Ok(())
    }

    async fn action_definition(
        &self,
        id: &ActionDefId,
    ) -> Result<Option<ActionDefinition>, StoreError> {
        Ok(self.inner.tables.read().action_defs.get(id).cloned())
    }

    async fn list_action_definitions(&self) -> Result<Vec<ActionDefinition>, StoreError> {
        let mut defs: Vec<_> = self.inner.tables.read().action_defs.values().cloned().collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(defs)
    }

    async fn create_action_definition(
        &self,
        def: ActionDefinition,
        actor: &ActorRef,
    ) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        if tables.action_defs.contains_key(&def.id) {
            return Err(StoreError::Conflict(format!(
                "action definition {} exists",
                def.id
            )));
        }
        let state = to_state(&def)?;
        tables.action_defs.insert(def.id.clone(), def.clone());
        append_locked(
            &mut tables,
            &self.inner.history,
            AppendChange {
                entity_type: "action_definition",
                entity_id: def.id.to_string(),
                state,
                change_note: None,
                changed_path: None,
                change_kind: ChangeKind::UpdateParent,
                actor: actor.clone(),
            },
        )?;
        Ok(())
    }

    async fn update_action_definition(
        &self,
        def: ActionDefinition,
        actor: &ActorRef,
    ) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        if !tables.action_defs.contains_key(&def.id) {
            return Err(StoreError::not_found("action definition", def.id.to_string()));
        }
        let state = to_state(&def)?;
        tables.action_defs.insert(def.id.clone(), def.clone());
        append_locked(
            &mut tables,
            &self.inner.history,
            AppendChange {
                entity_type: "action_definition",
                entity_id: def.id.to_string(),
                state,
                change_note: None,
                changed_path: None,
                change_kind: ChangeKind::UpdateParent,
                actor: actor.clone(),
            },
        )?;
        Ok(())
    }

    async fn delete_action_definition(&self, id: &ActionDefId) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        if tables.steps.values().any(|s| &s.action_id == id) {
            return Err(StoreError::InUse {
                entity: "action definition",
                id: id.to_string(),
                dependents: "pipeline steps",
            });
        }
        if tables
            .invocations
            .values()
            .any(|i| &i.action_definition_id == id)
        {
            return Err(StoreError::InUse {
                entity: "action definition",
                id: id.to_string(),
                dependents: "action invocations",
            });
        }
        tables
            .action_defs
            .remove(id)
            .ok_or_else(|| StoreError::not_found("action definition", id.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn pipeline(&self, id: &PipelineId) -> Result<Option<Pipeline>, StoreError> {
        Ok(self.inner.tables.read().pipelines.get(id).cloned())
    }

    async fn list_pipelines(&self) -> Result<Vec<Pipeline>, StoreError> {
        let mut pipelines: Vec<_> = self.inner.tables.read().pipelines.values().cloned().collect();
        pipelines.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(pipelines)
    }

    async fn create_pipeline(
        &self,
        pipeline: Pipeline,
        actor: &ActorRef,
    ) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        if tables.pipelines.contains_key(&pipeline.id) {
            return Err(StoreError::Conflict(format!("pipeline {} exists", pipeline.id)));
        }
        tables.pipelines.insert(pipeline.id.clone(), pipeline.clone());
        let state = pipeline_history_state(&tables, &pipeline.id);
        append_locked(
            &mut tables,
            &self.inner.history,
            AppendChange {
                entity_type: "pipeline",
                entity_id: pipeline.id.to_string(),
                state,
                change_note: None,
                changed_path: None,
                change_kind: ChangeKind::UpdateParent,
                actor: actor.clone(),
            },
        )?;
        Ok(())
    }

    async fn update_pipeline(
        &self,
        pipeline: Pipeline,
        actor: &ActorRef,
    ) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        if !tables.pipelines.contains_key(&pipeline.id) {
            return Err(StoreError::not_found("pipeline", pipeline.id.to_string()));
        }
        tables.pipelines.insert(pipeline.id.clone(), pipeline.clone());
        let state = pipeline_history_state(&tables, &pipeline.id);
        append_locked(
            &mut tables,
            &self.inner.history,
            AppendChange {
                entity_type: "pipeline",
                entity_id: pipeline.id.to_string(),
                state,
                change_note: None,
                changed_path: None,
                change_kind: ChangeKind::UpdateParent,
                actor: actor.clone(),
            },
        )?;
        Ok(())
    }

    async fn delete_pipeline(&self, id: &PipelineId) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        if tables.steps.values().any(|s| &s.pipeline_id == id) {
            return Err(StoreError::InUse {
                entity: "pipeline",
                id: id.to_string(),
                dependents: "pipeline steps",
            });
        }
        if tables.attachments.values().any(|a| &a.pipeline_id == id) {
            return Err(StoreError::InUse {
                entity: "pipeline",
                id: id.to_string(),
                dependents: "pipeline triggers",
            });
        }
        tables
            .pipelines
            .remove(id)
            .ok_or_else(|| StoreError::not_found("pipeline", id.to_string()))?;
        Ok(())
    }

    async fn pipeline_steps(&self, id: &PipelineId) -> Result<Vec<PipelineStep>, StoreError> {
        let mut steps: Vec<_> = self
            .inner
            .tables
            .read()
            .steps
            .values()
            .filter(|s| &s.pipeline_id == id)
            .cloned()
            .collect();
        steps.sort_by(|a, b| (a.sort_order, &a.id).cmp(&(b.sort_order, &b.id)));
        Ok(steps)
    }

    async fn add_pipeline_step(
        &self,
        step: PipelineStep,
        actor: &ActorRef,
    ) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        if !tables.pipelines.contains_key(&step.pipeline_id) {
            return Err(StoreError::not_found("pipeline", step.pipeline_id.to_string()));
        }
        if !tables.action_defs.contains_key(&step.action_id) {
            return Err(StoreError::not_found("action definition", step.action_id.to_string()));
        }
        let pipeline_id = step.pipeline_id.clone();
        let step_id = step.id.clone();
        tables.steps.insert(step.id.clone(), step);
        let state = pipeline_history_state(&tables, &pipeline_id);
        append_locked(
            &mut tables,
            &self.inner.history,
            AppendChange {
                entity_type: "pipeline",
                entity_id: pipeline_id.to_string(),
                state,
                change_note: None,
                changed_path: Some(format!("/steps/{step_id}")),
                change_kind: ChangeKind::AddChild,
                actor: actor.clone(),
            },
        )?;
        Ok(())
    }

    async fn update_pipeline_step(
        &self,
        step: PipelineStep,
        actor: &ActorRef,
    ) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        if !tables.steps.contains_key(&step.id) {
            return Err(StoreError::not_found("pipeline step", step.id.clone()));
        }
        let pipeline_id = step.pipeline_id.clone();
        let step_id = step.id.clone();
        tables.steps.insert(step.id.clone(), step);
        let state = pipeline_history_state(&tables, &pipeline_id);
        append_locked(
            &mut tables,
            &self.inner.history,
            AppendChange {
                entity_type: "pipeline",
                entity_id: pipeline_id.to_string(),
                state,
                change_note: None,
                changed_path: Some(format!("/steps/{step_id}")),
                change_kind: ChangeKind::UpdateChild,
                actor: actor.clone(),
            },
        )?;
        Ok(())
    }

    async fn remove_pipeline_step(
        &self,
        step_id: &str,
        actor: &ActorRef,
    ) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        let step = tables
            .steps
            .remove(step_id)
            .ok_or_else(|| StoreError::not_found("pipeline step", step_id))?;
        let state = pipeline_history_state(&tables, &step.pipeline_id);
        append_locked(
            &mut tables,
            &self.inner.history,
            AppendChange {
                entity_type: "pipeline",
                entity_id: step.pipeline_id.to_string(),
                state,
                change_note: None,
                changed_path: Some(format!("/steps/{step_id}")),
                change_kind: ChangeKind::RemoveChild,
                actor: actor.clone(),
            },
        )?;
        Ok(())
    }

    async fn attach_trigger(
        &self,
        attachment: PipelineTrigger,
        actor: &ActorRef,
    ) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        if !tables.pipelines.contains_key(&attachment.pipeline_id) {
            return Err(StoreError::not_found(
                "pipeline",
                attachment.pipeline_id.to_string(),
            ));
        }
        if !tables.trigger_defs.contains_key(&attachment.trigger_id) {
            return Err(StoreError::not_found(
                "trigger definition",
                attachment.trigger_id.to_string(),
            ));
        }
        let pipeline_id = attachment.pipeline_id.clone();
        let attachment_id = attachment.id.clone();
        tables.attachments.insert(attachment.id.clone(), attachment);
        let state = pipeline_history_state(&tables, &pipeline_id);
        append_locked(
            &mut tables,
            &self.inner.history,
            AppendChange {
                entity_type: "pipeline",
                entity_id: pipeline_id.to_string(),
                state,
                change_note: None,
                changed_path: Some(format!("/triggers/{attachment_id}")),
                change_kind: ChangeKind::AddChild,
                actor: actor.clone(),
            },
        )?;
        Ok(())
    }

    async fn detach_trigger(
        &self,
        attachment_id: &str,
        actor: &ActorRef,
    ) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        let attachment = tables
            .attachments
            .remove(attachment_id)
            .ok_or_else(|| StoreError::not_found("pipeline trigger", attachment_id))?;
        let state = pipeline_history_state(&tables, &attachment.pipeline_id);
        append_locked(
            &mut tables,
            &self.inner.history,
            AppendChange {
                entity_type: "pipeline",
                entity_id: attachment.pipeline_id.to_string(),
                state,
                change_note: None,
                changed_path: Some(format!("/triggers/{attachment_id}")),
                change_kind: ChangeKind::RemoveChild,
                actor: actor.clone(),
            },
        )?;
        Ok(())
    }

    async fn resolve_fanout(
        &self,
        trigger_id: &TriggerDefId,
    ) -> Result<Vec<ResolvedStep>, StoreError> {
        let tables = self.inner.tables.read();

        let mut attachments: Vec<&PipelineTrigger> = tables
            .attachments
            .values()
            .filter(|a| {
                a.is_enabled
                    && &a.trigger_id == trigger_id
                    && tables
                        .pipelines
                        .get(&a.pipeline_id)
                        .is_some_and(|p| p.is_enabled)
            })
            .collect();
        attachments.sort_by(|a, b| (a.sort_order, &a.id).cmp(&(b.sort_order, &b.id)));

        let mut resolved = Vec::new();
        for attachment in attachments {
            let mut steps: Vec<&PipelineStep> = tables
                .steps
                .values()
                .filter(|s| {
                    s.is_enabled
                        && s.pipeline_id == attachment.pipeline_id
                        && tables
                            .action_defs
                            .get(&s.action_id)
                            .is_some_and(|a| a.is_enabled)
                })
                .collect();
            steps.sort_by(|a, b| (a.sort_order, &a.id).cmp(&(b.sort_order, &b.id)));
            resolved.extend(steps.into_iter().map(|s| ResolvedStep {
                pipeline_id: s.pipeline_id.clone(),
                step_id: s.id.clone(),
                action_definition_id: s.action_id.clone(),
            }));
        }
        Ok(resolved)
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn record_trigger_event(
        &self,
        event: NewTriggerEvent,
    ) -> Result<TriggerEvent, StoreError> {
        let row = TriggerEvent {
            id: TriggerEventId::generate(),
            trigger_definition_id: event.trigger_definition_id,
            context: event.context,
            created_at: Utc::now(),
        };
        self.inner
            .tables
            .write()
            .trigger_events
            .insert(row.id.clone(), row.clone());
        Ok(row)
    }

    async fn trigger_event(
        &self,
        id: &TriggerEventId,
    ) -> Result<Option<TriggerEvent>, StoreError> {
        Ok(self.inner.tables.read().trigger_events.get(id).cloned())
    }

    async fn create_invocation(
        &self,
        new: NewInvocation,
    ) -> Result<ActionInvocation, StoreError> {
        let row = ActionInvocation {
            id: InvocationId::generate(),
            action_definition_id: new.action_definition_id,
            trigger_event_id: new.trigger_event_id,
            manual_invoker_id: new.manual_invoker_id,
            status: InvocationStatus::Pending,
            attempt: new.attempt,
            result: None,
            retry_at: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        self.inner
            .tables
            .write()
            .invocations
            .insert(row.id.clone(), row.clone());
        Ok(row)
    }

    async fn finalize_invocation(
        &self,
        id: &InvocationId,
        outcome: InvocationOutcome,
    ) -> Result<ActionInvocation, StoreError> {
        let mut tables = self.inner.tables.write();
        let row = tables
            .invocations
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("action invocation", id.to_string()))?;
        if row.status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "invocation {id} already finalized as {:?}",
                row.status
            )));
        }
        row.status = outcome.status;
        row.result = outcome.result;
        row.retry_at = outcome.retry_at;
        row.completed_at = Some(Utc::now());
        Ok(row.clone())
    }

    async fn invocation(
        &self,
        id: &InvocationId,
    ) -> Result<Option<ActionInvocation>, StoreError> {
        Ok(self.inner.tables.read().invocations.get(id).cloned())
    }

    async fn invocations_for_action(
        &self,
        action_id: &ActionDefId,
    ) -> Result<Vec<ActionInvocation>, StoreError> {
        let mut rows: Vec<_> = self
            .inner
            .tables
            .read()
            .invocations
            .values()
            .filter(|i| &i.action_definition_id == action_id)
            .cloned()
            .collect();
        rows.sort_by_key(|i| i.created_at);
        Ok(rows)
    }
}

#[async_trait]
impl BundleStore for MemoryStore {
    async fn bundle(&self, id: &BundleId) -> Result<Option<Bundle>, StoreError> {
        Ok(self.inner.tables.read().bundles.get(id).cloned())
    }

    async fn list_bundles(&self) -> Result<Vec<Bundle>, StoreError> {
        let mut bundles: Vec<_> = self.inner.tables.read().bundles.values().cloned().collect();
        bundles.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(bundles)
    }

    async fn create_bundle(&self, bundle: Bundle, actor: &ActorRef) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        if tables.bundles.contains_key(&bundle.id) {
            return Err(StoreError::Conflict(format!("bundle {} exists", bundle.id)));
        }
        tables.bundles.insert(bundle.id.clone(), bundle.clone());
        let state = bundle_history_state(&tables, &bundle.id);
        append_locked(
            &mut tables,
            &self.inner.history,
            AppendChange {
                entity_type: "bundle",
                entity_id: bundle.id.to_string(),
                state,
                change_note: None,
                changed_path: None,
                change_kind: ChangeKind::UpdateParent,
                actor: actor.clone(),
            },
        )?;
        Ok(())
    }

    async fn update_bundle(&self, bundle: Bundle, actor: &ActorRef) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        if !tables.bundles.contains_key(&bundle.id) {
            return Err(StoreError::not_found("bundle", bundle.id.to_string()));
        }
        tables.bundles.insert(bundle.id.clone(), bundle.clone());
        let state = bundle_history_state(&tables, &bundle.id);
        append_locked(
            &mut tables,
            &self.inner.history,
            AppendChange {
                entity_type: "bundle",
                entity_id: bundle.id.to_string(),
                state,
                change_note: None,
                changed_path: None,
                change_kind: ChangeKind::UpdateParent,
                actor: actor.clone(),
            },
        )?;
        Ok(())
    }

    async fn delete_bundle(&self, id: &BundleId) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        if tables.bundle_objects.values().any(|o| &o.bundle_id == id) {
            return Err(StoreError::InUse {
                entity: "bundle",
                id: id.to_string(),
                dependents: "bundle objects",
            });
        }
        if tables.assignments.values().any(|a| &a.bundle_id == id) {
            return Err(StoreError::InUse {
                entity: "bundle",
                id: id.to_string(),
                dependents: "bundle assignments",
            });
        }
        tables
            .bundles
            .remove(id)
            .ok_or_else(|| StoreError::not_found("bundle", id.to_string()))?;
        Ok(())
    }

    async fn commit_bundle_pointer(
        &self,
        id: &BundleId,
        pointer: BundlePointer,
    ) -> Result<Bundle, StoreError> {
        let mut tables = self.inner.tables.write();
        let bundle = tables
            .bundles
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("bundle", id.to_string()))?;
        bundle.storage_path = pointer.storage_path;
        bundle.checksum = pointer.checksum;
        bundle.bundle_digest = pointer.bundle_digest;
        bundle.updated_at = pointer.updated_at;
        let committed = bundle.clone();

        let state = bundle_history_state(&tables, id);
        append_locked(
            &mut tables,
            &self.inner.history,
            AppendChange {
                entity_type: "bundle",
                entity_id: id.to_string(),
                state,
                change_note: Some("archive rebuilt".to_owned()),
                changed_path: None,
                change_kind: ChangeKind::UpdateParent,
                actor: ActorRef::system(),
            },
        )?;
        Ok(committed)
    }

    async fn bundle_objects(&self, id: &BundleId) -> Result<Vec<BundleObject>, StoreError> {
        let mut objects: Vec<_> = self
            .inner
            .tables
            .read()
            .bundle_objects
            .values()
            .filter(|o| &o.bundle_id == id)
            .cloned()
            .collect();
        objects.sort_by(|a, b| (a.sort_order, &a.id).cmp(&(b.sort_order, &b.id)));
        Ok(objects)
    }

    async fn enabled_bundle_objects_with_files(
        &self,
        id: &BundleId,
    ) -> Result<Vec<(BundleObject, FileRecord)>, StoreError> {
        let tables = self.inner.tables.read();
        let mut objects: Vec<&BundleObject> = tables
            .bundle_objects
            .values()
            .filter(|o| o.is_enabled && &o.bundle_id == id)
            .collect();
        objects.sort_by(|a, b| (a.sort_order, &a.id).cmp(&(b.sort_order, &b.id)));

        let mut joined = Vec::with_capacity(objects.len());
        for object in objects {
            let file = tables.files.get(&object.file_id).ok_or_else(|| {
                StoreError::not_found("file", object.file_id.to_string())
            })?;
            joined.push((object.clone(), file.clone()));
        }
        Ok(joined)
    }

    async fn add_bundle_object(
        &self,
        object: BundleObject,
        actor: &ActorRef,
    ) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        if !tables.bundles.contains_key(&object.bundle_id) {
            return Err(StoreError::not_found("bundle", object.bundle_id.to_string()));
        }
        if !tables.files.contains_key(&object.file_id) {
            return Err(StoreError::not_found("file", object.file_id.to_string()));
        }
        let bundle_id = object.bundle_id.clone();
        let object_id = object.id.clone();
        tables.bundle_objects.insert(object.id.clone(), object);
        let state = bundle_history_state(&tables, &bundle_id);
        append_locked(
            &mut tables,
            &self.inner.history,
            AppendChange {
                entity_type: "bundle",
                entity_id: bundle_id.to_string(),
                state,
                change_note: None,
                changed_path: Some(format!("/objects/{object_id}")),
                change_kind: ChangeKind::AddChild,
                actor: actor.clone(),
            },
        )?;
        Ok(())
    }

    async fn update_bundle_object(
        &self,
        object: BundleObject,
        actor: &ActorRef,
    ) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        if !tables.bundle_objects.contains_key(&object.id) {
            return Err(StoreError::not_found("bundle object", object.id.clone()));
        }
        let bundle_id = object.bundle_id.clone();
        let object_id = object.id.clone();
        tables.bundle_objects.insert(object.id.clone(), object);
        let state = bundle_history_state(&tables, &bundle_id);
        append_locked(
            &mut tables,
            &self.inner.history,
            AppendChange {
                entity_type: "bundle",
                entity_id: bundle_id.to_string(),
                state,
                change_note: None,
                changed_path: Some(format!("/objects/{object_id}")),
                change_kind: ChangeKind::UpdateChild,
                actor: actor.clone(),
            },
        )?;
        Ok(())
    }

    async fn bundles_containing_files(
        &self,
        files: &[FileId],
    ) -> Result<Vec<BundleId>, StoreError> {
        let tables = self.inner.tables.read();
        let mut out: Vec<BundleId> = tables
            .bundle_objects
            .values()
            .filter(|o| files.contains(&o.file_id))
            .map(|o| o.bundle_id.clone())
            .collect();
        out.sort();
        out.dedup();
        Ok(out)
    }
}

#[async_trait]
impl FileStore for MemoryStore {
    async fn file(&self, id: &FileId) -> Result<Option<FileRecord>, StoreError> {
        Ok(self.inner.tables.read().files.get(id).cloned())
    }

    async fn file_by_key(&self, key: &str) -> Result<Option<FileRecord>, StoreError> {
        Ok(self
            .inner
            .tables
            .read()
            .files
            .values()
            .find(|f| f.key == key)
            .cloned())
    }

    async fn list_files(&self) -> Result<Vec<FileRecord>, StoreError> {
        let mut files: Vec<_> = self.inner.tables.read().files.values().cloned().collect();
        files.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(files)
    }

    async fn create_file(&self, file: FileRecord) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        if tables.files.values().any(|f| f.key == file.key) {
            return Err(StoreError::Conflict(format!("file key {} exists", file.key)));
        }
        tables.files.insert(file.id.clone(), file);
        Ok(())
    }

    async fn update_file(&self, file: FileRecord) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        if !tables.files.contains_key(&file.id) {
            return Err(StoreError::not_found("file", file.id.to_string()));
        }
        if tables
            .files
            .values()
            .any(|f| f.key == file.key && f.id != file.id)
        {
            return Err(StoreError::Conflict(format!("file key {} exists", file.key)));
        }
        tables.files.insert(file.id.clone(), file);
        Ok(())
    }

    async fn delete_file(&self, id: &FileId) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        if tables.bundle_objects.values().any(|o| &o.file_id == id) {
            return Err(StoreError::InUse {
                entity: "file",
                id: id.to_string(),
                dependents: "bundle objects",
            });
        }
        tables
            .files
            .remove(id)
            .ok_or_else(|| StoreError::not_found("file", id.to_string()))?;
        Ok(())
    }
}

struct MemoryDownloadTx {
    inner: Arc<Inner>,
    assignment: BundleAssignment,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl DownloadTx for MemoryDownloadTx {
    fn assignment(&self) -> &BundleAssignment {
        &self.assignment
    }

    async fn download_count(&self) -> Result<u64, StoreError> {
        let tables = self.inner.tables.read();
        Ok(tables
            .download_events
            .iter()
            .filter(|e| e.bundle_assignment_id == self.assignment.id)
            .count() as u64)
    }

    async fn commit(
        self: Box<Self>,
        event: NewDownloadEvent,
    ) -> Result<DownloadEvent, StoreError> {
        let mut tables = self.inner.tables.write();
        let assignment = tables
            .assignments
            .get_mut(&self.assignment.id)
            .ok_or_else(|| {
                StoreError::not_found("bundle assignment", self.assignment.id.to_string())
            })?;
        assignment.last_download_at = Some(event.downloaded_at);

        let row = DownloadEvent {
            id: new_row_id(),
            bundle_assignment_id: self.assignment.id.clone(),
            downloaded_at: event.downloaded_at,
            ip: event.ip,
            user_agent: event.user_agent,
        };
        tables.download_events.push(row.clone());
        Ok(row)
    }
}

#[async_trait]
impl RecipientStore for MemoryStore {
    async fn recipient(&self, id: &RecipientId) -> Result<Option<Recipient>, StoreError> {
        Ok(self.inner.tables.read().recipients.get(id).cloned())
    }

    async fn recipient_by_email(&self, email: &str) -> Result<Option<Recipient>, StoreError> {
        let needle = email.to_lowercase();
        Ok(self
            .inner
            .tables
            .read()
            .recipients
            .values()
            .find(|r| r.email == needle)
            .cloned())
    }

    async fn list_recipients(&self) -> Result<Vec<Recipient>, StoreError> {
        let mut recipients: Vec<_> =
            self.inner.tables.read().recipients.values().cloned().collect();
        recipients.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(recipients)
    }

    async fn create_recipient(
        &self,
        mut recipient: Recipient,
        actor: &ActorRef,
    ) -> Result<(), StoreError> {
        recipient.email = recipient.email.to_lowercase();
        let mut tables = self.inner.tables.write();
        if tables.recipients.values().any(|r| r.email == recipient.email) {
            return Err(StoreError::Conflict(format!(
                "recipient email {} exists",
                recipient.email
            )));
        }
        let state = to_state(&recipient)?;
        tables.recipients.insert(recipient.id.clone(), recipient.clone());
        append_locked(
            &mut tables,
            &self.inner.history,
            AppendChange {
                entity_type: "recipient",
                entity_id: recipient.id.to_string(),
                state,
                change_note: None,
                changed_path: None,
                change_kind: ChangeKind::UpdateParent,
                actor: actor.clone(),
            },
        )?;
        Ok(())
    }

    async fn update_recipient(
        &self,
        mut recipient: Recipient,
        actor: &ActorRef,
    ) -> Result<(), StoreError> {
        recipient.email = recipient.email.to_lowercase();
        let mut tables = self.inner.tables.write();
        if !tables.recipients.contains_key(&recipient.id) {
            return Err(StoreError::not_found("recipient", recipient.id.to_string()));
        }
        let state = to_state(&recipient)?;
        tables.recipients.insert(recipient.id.clone(), recipient.clone());
        append_locked(
            &mut tables,
            &self.inner.history,
            AppendChange {
                entity_type: "recipient",
                entity_id: recipient.id.to_string(),
                state,
                change_note: None,
                changed_path: None,
                change_kind: ChangeKind::UpdateParent,
                actor: actor.clone(),
            },
        )?;
        Ok(())
    }

    async fn delete_recipient(&self, id: &RecipientId) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        if tables.assignments.values().any(|a| &a.recipient_id == id) {
            return Err(StoreError::InUse {
                entity: "recipient",
                id: id.to_string(),
                dependents: "bundle assignments",
            });
        }
        tables
            .recipients
            .remove(id)
            .ok_or_else(|| StoreError::not_found("recipient", id.to_string()))?;
        Ok(())
    }

    async fn assignment(
        &self,
        id: &AssignmentId,
    ) -> Result<Option<BundleAssignment>, StoreError> {
        Ok(self.inner.tables.read().assignments.get(id).cloned())
    }

    async fn assignment_for(
        &self,
        bundle: &BundleId,
        recipient: &RecipientId,
    ) -> Result<Option<BundleAssignment>, StoreError> {
        Ok(self
            .inner
            .tables
            .read()
            .assignments
            .values()
            .find(|a| &a.bundle_id == bundle && &a.recipient_id == recipient)
            .cloned())
    }

    async fn assignments_for_bundle(
        &self,
        bundle: &BundleId,
    ) -> Result<Vec<BundleAssignment>, StoreError> {
        let mut rows: Vec<_> = self
            .inner
            .tables
            .read()
            .assignments
            .values()
            .filter(|a| &a.bundle_id == bundle)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rows)
    }

    async fn assignments_for_recipient(
        &self,
        recipient: &RecipientId,
    ) -> Result<Vec<BundleAssignment>, StoreError> {
        let mut rows: Vec<_> = self
            .inner
            .tables
            .read()
            .assignments
            .values()
            .filter(|a| &a.recipient_id == recipient)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rows)
    }

    async fn create_assignment(&self, assignment: BundleAssignment) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        if tables
            .assignments
            .values()
            .any(|a| a.bundle_id == assignment.bundle_id && a.recipient_id == assignment.recipient_id)
        {
            return Err(StoreError::Conflict(format!(
                "assignment for bundle {} and recipient {} exists",
                assignment.bundle_id, assignment.recipient_id
            )));
        }
        tables.assignments.insert(assignment.id.clone(), assignment);
        Ok(())
    }

    async fn update_assignment(&self, assignment: BundleAssignment) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        if !tables.assignments.contains_key(&assignment.id) {
            return Err(StoreError::not_found(
                "bundle assignment",
                assignment.id.to_string(),
            ));
        }
        tables.assignments.insert(assignment.id.clone(), assignment);
        Ok(())
    }

    async fn delete_assignment(&self, id: &AssignmentId) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        tables
            .assignments
            .remove(id)
            .ok_or_else(|| StoreError::not_found("bundle assignment", id.to_string()))?;
        // Download events are append-only audit; they outlive the assignment.
        Ok(())
    }

    async fn download_events(
        &self,
        assignment: &AssignmentId,
    ) -> Result<Vec<DownloadEvent>, StoreError> {
        Ok(self
            .inner
            .tables
            .read()
            .download_events
            .iter()
            .filter(|e| &e.bundle_assignment_id == assignment)
            .cloned()
            .collect())
    }

    async fn begin_download(
        &self,
        assignment: &AssignmentId,
    ) -> Result<Box<dyn DownloadTx>, StoreError> {
        let lock = {
            let mut locks = self.inner.assignment_locks.lock();
            locks
                .entry(assignment.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let guard = lock.lock_owned().await;

        // Re-read under the lock: a racing admission may have just committed.
        let row = self
            .inner
            .tables
            .read()
            .assignments
            .get(assignment)
            .cloned()
            .ok_or_else(|| StoreError::not_found("bundle assignment", assignment.to_string()))?;

        Ok(Box::new(MemoryDownloadTx {
            inner: self.inner.clone(),
            assignment: row,
            _guard: guard,
        }))
    }
}

#[async_trait]
impl AuthStore for MemoryStore {
    async fn upsert_user_by_email(&self, email: &str) -> Result<User, StoreError> {
        let email = email.to_lowercase();
        let mut tables = self.inner.tables.write();
        if let Some(user) = tables.users.values().find(|u| u.email == email) {
            return Ok(user.clone());
        }
        let user = User {
            id: UserId::generate(),
            email,
            name: None,
            is_admin: true,
            created_at: Utc::now(),
        };
        tables.users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn user(&self, id: &UserId) -> Result<Option<User>, StoreError> {
        Ok(self.inner.tables.read().users.get(id).cloned())
    }

    async fn create_session(&self, session: Session) -> Result<(), StoreError> {
        self.inner
            .tables
            .write()
            .sessions
            .insert(session.token_hash.clone(), session);
        Ok(())
    }

    async fn session_by_token_hash(&self, hash: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.inner.tables.read().sessions.get(hash).cloned())
    }

    async fn revoke_session(&self, hash: &str) -> Result<(), StoreError> {
        if let Some(session) = self.inner.tables.write().sessions.get_mut(hash) {
            session.revoked_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn create_magic_link(&self, link: MagicLink) -> Result<(), StoreError> {
        self.inner
            .tables
            .write()
            .magic_links
            .insert(link.token_hash.clone(), link);
        Ok(())
    }

    async fn consume_magic_link(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<MagicLink, StoreError> {
        let mut tables = self.inner.tables.write();
        let link = tables
            .magic_links
            .get_mut(token_hash)
            .ok_or_else(|| StoreError::not_found("magic link", token_hash))?;
        if link.consumed_at.is_some() {
            return Err(StoreError::Consumed("magic link"));
        }
        if link.expires_at <= now {
            return Err(StoreError::Expired("magic link"));
        }
        link.consumed_at = Some(now);
        Ok(link.clone())
    }

    async fn replace_recipient_otp(&self, otp: RecipientOtp) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        tables
            .otps
            .retain(|_, existing| existing.recipient_id != otp.recipient_id);
        tables.otps.insert(otp.id.clone(), otp);
        Ok(())
    }

    async fn active_otp_for_recipient(
        &self,
        recipient: &RecipientId,
    ) -> Result<Option<RecipientOtp>, StoreError> {
        Ok(self
            .inner
            .tables
            .read()
            .otps
            .values()
            .find(|o| &o.recipient_id == recipient)
            .cloned())
    }

    async fn increment_otp_attempts(&self, otp_id: &str) -> Result<u32, StoreError> {
        let mut tables = self.inner.tables.write();
        let otp = tables
            .otps
            .get_mut(otp_id)
            .ok_or_else(|| StoreError::not_found("recipient otp", otp_id))?;
        otp.attempts += 1;
        Ok(otp.attempts)
    }

    async fn delete_otp(&self, otp_id: &str) -> Result<(), StoreError> {
        self.inner.tables.write().otps.remove(otp_id);
        Ok(())
    }

    async fn create_recipient_session(
        &self,
        session: RecipientSession,
    ) -> Result<(), StoreError> {
        self.inner
            .tables
            .write()
            .recipient_sessions
            .insert(session.token_hash.clone(), session);
        Ok(())
    }

    async fn recipient_session_by_token_hash(
        &self,
        hash: &str,
    ) -> Result<Option<RecipientSession>, StoreError> {
        Ok(self.inner.tables.read().recipient_sessions.get(hash).cloned())
    }

    async fn revoke_recipient_session(&self, hash: &str) -> Result<(), StoreError> {
        if let Some(session) = self.inner.tables.write().recipient_sessions.get_mut(hash) {
            session.revoked_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn create_device_auth(&self, device: DeviceAuth) -> Result<(), StoreError> {
        self.inner
            .tables
            .write()
            .device_auths
            .insert(device.id.clone(), device);
        Ok(())
    }

    async fn device_auth_by_device_code_hash(
        &self,
        hash: &str,
    ) -> Result<Option<DeviceAuth>, StoreError> {
        Ok(self
            .inner
            .tables
            .read()
            .device_auths
            .values()
            .find(|d| d.device_code_hash == hash)
            .cloned())
    }

    async fn device_auth_by_user_code_hash(
        &self,
        hash: &str,
    ) -> Result<Option<DeviceAuth>, StoreError> {
        Ok(self
            .inner
            .tables
            .read()
            .device_auths
            .values()
            .find(|d| d.user_code_hash == hash)
            .cloned())
    }

    async fn update_device_auth(&self, device: DeviceAuth) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        if !tables.device_auths.contains_key(&device.id) {
            return Err(StoreError::not_found("device auth", device.id.to_string()));
        }
        tables.device_auths.insert(device.id.clone(), device);
        Ok(())
    }

    async fn device_auth(&self, id: &DeviceAuthId) -> Result<Option<DeviceAuth>, StoreError> {
        Ok(self.inner.tables.read().device_auths.get(id).cloned())
    }

    async fn create_api_token(&self, token: ApiToken) -> Result<(), StoreError> {
        self.inner
            .tables
            .write()
            .api_tokens
            .insert(token.id.clone(), token);
        Ok(())
    }

    async fn api_token_by_hash(&self, hash: &str) -> Result<Option<ApiToken>, StoreError> {
        Ok(self
            .inner
            .tables
            .read()
            .api_tokens
            .values()
            .find(|t| t.token_hash == hash)
            .cloned())
    }

    async fn api_tokens_for_user(&self, user: &UserId) -> Result<Vec<ApiToken>, StoreError> {
        let mut tokens: Vec<_> = self
            .inner
            .tables
            .read()
            .api_tokens
            .values()
            .filter(|t| &t.user_id == user)
            .cloned()
            .collect();
        tokens.sort_by_key(|t| t.created_at);
        Ok(tokens)
    }

    async fn api_token(&self, id: &TokenId) -> Result<Option<ApiToken>, StoreError> {
        Ok(self.inner.tables.read().api_tokens.get(id).cloned())
    }

    async fn update_api_token(&self, token: ApiToken) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.write();
        if !tables.api_tokens.contains_key(&token.id) {
            return Err(StoreError::not_found("api token", token.id.to_string()));
        }
        tables.api_tokens.insert(token.id.clone(), token);
        Ok(())
    }
}

#[async_trait]
impl ChangeLogStore for MemoryStore {
    async fn append_change(&self, change: AppendChange) -> Result<ChangeLogRow, StoreError> {
        let mut tables = self.inner.tables.write();
        append_locked(&mut tables, &self.inner.history, change)
    }

    async fn history(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<ChangeLogRow>, StoreError> {
        Ok(self
            .inner
            .tables
            .read()
            .changelog
            .get(&(entity_type.to_owned(), entity_id.to_owned()))
            .cloned()
            .unwrap_or_default())
    }

    async fn materialize(
        &self,
        entity_type: &str,
        entity_id: &str,
        version: u64,
    ) -> Result<serde_json::Value, StoreError> {
        let tables = self.inner.tables.read();
        let rows = tables
            .changelog
            .get(&(entity_type.to_owned(), entity_id.to_owned()))
            .ok_or_else(|| StoreError::VersionNotFound {
                entity_type: entity_type.to_owned(),
                entity_id: entity_id.to_owned(),
                version,
            })?;
        if version == 0 || version > rows.len() as u64 {
            return Err(StoreError::VersionNotFound {
                entity_type: entity_type.to_owned(),
                entity_id: entity_id.to_owned(),
                version,
            });
        }

        // Versions are dense and ascending, so row index = version - 1.
        let target = (version - 1) as usize;
        let snapshot_idx = rows[..=target]
            .iter()
            .rposition(|r| r.is_snapshot)
            .ok_or_else(|| StoreError::Backend("history chain has no snapshot".to_owned()))?;

        let depth = target - snapshot_idx;
        if depth as u32 > self.inner.history.max_chain_depth {
            return Err(StoreError::ChainTooDeep {
                entity_type: entity_type.to_owned(),
                entity_id: entity_id.to_owned(),
                max: self.inner.history.max_chain_depth,
            });
        }

        let mut state = rows[snapshot_idx].state.clone();
        for row in &rows[snapshot_idx + 1..=target] {
            let patch: json_patch::Patch = serde_json::from_value(row.state.clone())
                .map_err(|e| StoreError::Backend(format!("corrupt delta row: {e}")))?;
            json_patch::patch(&mut state, &patch)
                .map_err(|e| StoreError::Backend(format!("delta application failed: {e}")))?;
        }
        Ok(state)
    }
}
