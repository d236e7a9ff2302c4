//! Manager and runner behaviour against the in-memory store.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use latchflow_core::{
    ActionDefId, ActionDefinition, ActorRef, CapabilityId, CapabilityKind, Pipeline, PipelineId,
    PipelineStep, PipelineTrigger, PluginCapability, PluginId, TriggerDefId, TriggerDefinition,
    UserId,
};
use latchflow_crypto::ConfigCipher;
use latchflow_plugin::{
    ActionInput, ActionRuntime, AuditPhase, CapabilityRef, ExecuteResult, MemoryAuditSink,
    PluginRegistry, PluginServiceError, RuntimeContext, RuntimeHandle, RuntimeServices,
    TriggerPayload, TriggerRuntime,
};
use latchflow_queue::{ActionHandler, ActionMessage, QueueDriver, QueueError};
use latchflow_store::{DefinitionStore, MemoryStore, PipelineStore, RunStore};
use latchflow_triggers::{TriggerManager, TriggerRunner};

/// Queue double that records enqueues without delivering them.
#[derive(Default)]
struct RecordingQueue {
    messages: Mutex<Vec<ActionMessage>>,
}

#[async_trait]
impl QueueDriver for RecordingQueue {
    async fn enqueue_action(&self, msg: ActionMessage) -> Result<(), QueueError> {
        self.messages.lock().push(msg);
        Ok(())
    }

    async fn consume_actions(
        &self,
        _handler: Arc<dyn ActionHandler>,
    ) -> Result<(), QueueError> {
        Ok(())
    }

    async fn shutdown(&self) {}
}

/// Trigger runtime double that exposes its services for manual emits.
struct ManualTrigger {
    services: RuntimeServices,
    hot_config: bool,
    last_config: Mutex<Option<serde_json::Value>>,
}

#[async_trait]
impl TriggerRuntime for ManualTrigger {
    async fn start(&self) -> Result<(), PluginServiceError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), PluginServiceError> {
        Ok(())
    }

    fn supports_config_change(&self) -> bool {
        self.hot_config
    }

    async fn on_config_change(
        &self,
        config: &serde_json::Value,
    ) -> Result<(), PluginServiceError> {
        *self.last_config.lock() = Some(config.clone());
        Ok(())
    }
}

struct NoopAction;

#[async_trait]
impl ActionRuntime for NoopAction {
    async fn execute(&self, _input: ActionInput) -> Result<ExecuteResult, latchflow_plugin::ActionError> {
        Ok(ExecuteResult::Completed(serde_json::Value::Null))
    }
}

struct Harness {
    store: MemoryStore,
    queue: Arc<RecordingQueue>,
    audit: Arc<MemoryAuditSink>,
    manager: Arc<TriggerManager>,
    /// Runtimes created by the trigger factory, for emitting manually.
    created: Arc<Mutex<Vec<Arc<ManualTrigger>>>>,
}

fn capability(id: &str, kind: CapabilityKind, key: &str) -> PluginCapability {
    PluginCapability {
        id: CapabilityId::new(id),
        plugin_id: PluginId::new("plug-test"),
        kind,
        key: key.to_owned(),
        display_name: key.to_owned(),
        config_schema: None,
        is_enabled: true,
    }
}

fn harness(hot_config: bool) -> Harness {
    let store = MemoryStore::new();
    let queue = Arc::new(RecordingQueue::default());
    let audit = Arc::new(MemoryAuditSink::new());
    let registry = Arc::new(PluginRegistry::new());
    let created: Arc<Mutex<Vec<Arc<ManualTrigger>>>> = Arc::new(Mutex::new(Vec::new()));

    let created_in_factory = created.clone();
    registry
        .register_trigger(CapabilityRef {
            plugin_name: "plug-test".into(),
            plugin_id: PluginId::new("plug-test"),
            capability: capability("cap-trig", CapabilityKind::Trigger, "manual"),
            factory: Arc::new(move |ctx: RuntimeContext| {
                let runtime = Arc::new(ManualTrigger {
                    services: ctx.services,
                    hot_config,
                    last_config: Mutex::new(None),
                });
                created_in_factory.lock().push(runtime.clone());
                // Hand the registry a second Arc wrapped as the managed runtime.
                struct Shared(Arc<ManualTrigger>);
                #[async_trait]
                impl TriggerRuntime for Shared {
                    async fn start(&self) -> Result<(), PluginServiceError> {
                        self.0.start().await
                    }
                    async fn stop(&self) -> Result<(), PluginServiceError> {
                        self.0.stop().await
                    }
                    fn supports_config_change(&self) -> bool {
                        self.0.supports_config_change()
                    }
                    async fn on_config_change(
                        &self,
                        config: &serde_json::Value,
                    ) -> Result<(), PluginServiceError> {
                        self.0.on_config_change(config).await
                    }
                }
                Ok(RuntimeHandle::Trigger(Box::new(Shared(runtime))))
            }),
        })
        .unwrap();
    registry
        .register_action(CapabilityRef {
            plugin_name: "plug-test".into(),
            plugin_id: PluginId::new("plug-test"),
            capability: capability("cap-act", CapabilityKind::Action, "noop"),
            factory: Arc::new(|_ctx: RuntimeContext| {
                Ok(RuntimeHandle::Action(Box::new(NoopAction)))
            }),
        })
        .unwrap();

    let store_arc: Arc<MemoryStore> = Arc::new(store.clone());
    let runner = Arc::new(TriggerRunner::new(store_arc.clone(), queue.clone()));
    let manager = TriggerManager::new(
        store_arc,
        registry,
        Arc::new(ConfigCipher::plaintext()),
        audit.clone(),
        runner,
    );

    Harness {
        store,
        queue,
        audit,
        manager,
        created,
    }
}

fn trigger_def(id: &str, enabled: bool) -> TriggerDefinition {
    TriggerDefinition {
        id: TriggerDefId::new(id),
        capability_id: CapabilityId::new("cap-trig"),
        name: id.to_owned(),
        config: serde_json::json!({"interval": 5}),
        is_enabled: enabled,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        created_by: UserId::new("admin"),
        updated_by: UserId::new("admin"),
    }
}

fn action_def(id: &str) -> ActionDefinition {
    ActionDefinition {
        id: ActionDefId::new(id),
        capability_id: CapabilityId::new("cap-act"),
        name: id.to_owned(),
        config: serde_json::json!({}),
        is_enabled: true,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        created_by: UserId::new("admin"),
        updated_by: UserId::new("admin"),
    }
}

async fn seed_pipeline(store: &MemoryStore, trigger: &str, actions: &[&str]) {
    let a = ActorRef::user(UserId::new("admin"));
    store
        .create_pipeline(
            Pipeline {
                id: PipelineId::new("p-1"),
                name: "p-1".into(),
                description: None,
                is_enabled: true,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            &a,
        )
        .await
        .unwrap();
    store
        .attach_trigger(
            PipelineTrigger {
                id: "at-1".into(),
                pipeline_id: PipelineId::new("p-1"),
                trigger_id: TriggerDefId::new(trigger),
                sort_order: 1,
                is_enabled: true,
            },
            &a,
        )
        .await
        .unwrap();
    for (i, action) in actions.iter().enumerate() {
        store
            .add_pipeline_step(
                PipelineStep {
                    id: format!("s-{i}"),
                    pipeline_id: PipelineId::new("p-1"),
                    action_id: ActionDefId::new(*action),
                    sort_order: i as i32,
                    is_enabled: true,
                },
                &a,
            )
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn start_all_starts_only_enabled_definitions() {
    let h = harness(false);
    let a = ActorRef::user(UserId::new("admin"));
    h.store
        .create_trigger_definition(trigger_def("t-on", true), &a)
        .await
        .unwrap();
    h.store
        .create_trigger_definition(trigger_def("t-off", false), &a)
        .await
        .unwrap();

    h.manager.start_all().await.unwrap();
    assert_eq!(h.manager.running_count(), 1);
    assert!(h.manager.is_running(&TriggerDefId::new("t-on")));
    assert!(!h.manager.is_running(&TriggerDefId::new("t-off")));
}

#[tokio::test]
async fn emit_persists_event_and_enqueues_in_step_order() {
    let h = harness(false);
    let a = ActorRef::user(UserId::new("admin"));
    h.store
        .create_trigger_definition(trigger_def("t-1", true), &a)
        .await
        .unwrap();
    for action in ["a-1", "a-2"] {
        h.store
            .create_action_definition(action_def(action), &a)
            .await
            .unwrap();
    }
    seed_pipeline(&h.store, "t-1", &["a-1", "a-2"]).await;

    h.manager.start_all().await.unwrap();
    let runtime = h.created.lock().last().cloned().unwrap();

    let event_id = runtime
        .services
        .emit(TriggerPayload {
            context: Some(serde_json::json!({"source": "test"})),
            metadata: None,
            scheduled_for: None,
        })
        .await
        .unwrap();

    let event = h.store.trigger_event(&event_id).await.unwrap().unwrap();
    assert_eq!(event.trigger_definition_id, TriggerDefId::new("t-1"));
    assert_eq!(event.context, Some(serde_json::json!({"source": "test"})));

    let messages = h.queue.messages.lock();
    let actions: Vec<&str> = messages
        .iter()
        .map(|m| m.action_definition_id.as_str())
        .collect();
    assert_eq!(actions, ["a-1", "a-2"]);
    assert!(messages.iter().all(|m| m.attempt == 1));
    assert!(
        messages
            .iter()
            .all(|m| m.trigger_event_id.as_ref() == Some(&event_id))
    );

    // STARTED then SUCCEEDED, with the event id attached.
    let entries = h.audit.trigger_entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].phase, AuditPhase::Started);
    assert_eq!(entries[1].phase, AuditPhase::Succeeded);
    assert_eq!(entries[1].trigger_event_id.as_ref(), Some(&event_id));
}

#[tokio::test]
async fn reload_removes_disabled_definition() {
    let h = harness(false);
    let a = ActorRef::user(UserId::new("admin"));
    let mut def = trigger_def("t-1", true);
    h.store
        .create_trigger_definition(def.clone(), &a)
        .await
        .unwrap();
    h.manager.start_all().await.unwrap();
    assert!(h.manager.is_running(&def.id));

    def.is_enabled = false;
    h.store.update_trigger_definition(def.clone(), &a).await.unwrap();
    h.manager.reload_trigger(&def.id).await.unwrap();
    assert!(!h.manager.is_running(&def.id));
}

#[tokio::test]
async fn notify_config_change_hot_applies_in_place() {
    let h = harness(true);
    let a = ActorRef::user(UserId::new("admin"));
    h.store
        .create_trigger_definition(trigger_def("t-1", true), &a)
        .await
        .unwrap();
    h.manager.start_all().await.unwrap();
    let before = h.created.lock().len();

    h.manager
        .notify_config_change(&TriggerDefId::new("t-1"), &serde_json::json!({"interval": 9}))
        .await
        .unwrap();

    // No new runtime was constructed; the config landed on the live one.
    assert_eq!(h.created.lock().len(), before);
    let runtime = h.created.lock().last().cloned().unwrap();
    assert_eq!(
        runtime.last_config.lock().clone(),
        Some(serde_json::json!({"interval": 9}))
    );
}

#[tokio::test]
async fn notify_config_change_cold_reloads() {
    let h = harness(false);
    let a = ActorRef::user(UserId::new("admin"));
    h.store
        .create_trigger_definition(trigger_def("t-1", true), &a)
        .await
        .unwrap();
    h.manager.start_all().await.unwrap();
    let before = h.created.lock().len();

    h.manager
        .notify_config_change(&TriggerDefId::new("t-1"), &serde_json::json!({"interval": 9}))
        .await
        .unwrap();

    // Cold path restarts the runtime from the stored definition.
    assert_eq!(h.created.lock().len(), before + 1);
    assert!(h.manager.is_running(&TriggerDefId::new("t-1")));
}

#[tokio::test]
async fn stop_all_clears_managed_runtimes() {
    let h = harness(false);
    let a = ActorRef::user(UserId::new("admin"));
    h.store
        .create_trigger_definition(trigger_def("t-1", true), &a)
        .await
        .unwrap();
    h.manager.start_all().await.unwrap();
    assert_eq!(h.manager.running_count(), 1);

    h.manager.stop_all().await;
    assert_eq!(h.manager.running_count(), 0);
}
