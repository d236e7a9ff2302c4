use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use tracing::{error, info, instrument, warn};

use latchflow_core::{TriggerDefId, TriggerDefinition, TriggerEventId};
use latchflow_crypto::ConfigCipher;
use latchflow_plugin::{
    AuditPhase, CapabilityRef, EmitFn, PluginRegistry, PluginServiceError, RuntimeAuditSink,
    RuntimeContext, TriggerAuditEntry, TriggerPayload, TriggerRuntime,
};
use latchflow_store::LatchflowStore;

use crate::error::TriggerError;
use crate::runner::TriggerRunner;

struct ManagedTrigger {
    cap_ref: Arc<CapabilityRef>,
    runtime: Arc<dyn TriggerRuntime>,
}

/// Keeps exactly the set of enabled trigger runtimes alive.
///
/// Construction returns an `Arc` because every started runtime holds a weak
/// reference back to the manager through its emit closure.
pub struct TriggerManager {
    store: Arc<dyn LatchflowStore>,
    registry: Arc<PluginRegistry>,
    cipher: Arc<ConfigCipher>,
    audit: Arc<dyn RuntimeAuditSink>,
    runner: Arc<TriggerRunner>,
    running: DashMap<TriggerDefId, ManagedTrigger>,
}

impl TriggerManager {
    pub fn new(
        store: Arc<dyn LatchflowStore>,
        registry: Arc<PluginRegistry>,
        cipher: Arc<ConfigCipher>,
        audit: Arc<dyn RuntimeAuditSink>,
        runner: Arc<TriggerRunner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            cipher,
            audit,
            runner,
            running: DashMap::new(),
        })
    }

    /// Number of currently managed runtimes.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Whether a runtime is managed for this definition.
    #[must_use]
    pub fn is_running(&self, id: &TriggerDefId) -> bool {
        self.running.contains_key(id)
    }

    /// Start every enabled trigger definition. Individual failures are
    /// logged and do not abort the batch.
    pub async fn start_all(self: &Arc<Self>) -> Result<(), TriggerError> {
        let defs = self.store.enabled_trigger_definitions().await?;
        for def in defs {
            if let Err(e) = self.start_trigger(&def).await {
                error!(trigger = %def.id, error = %e, "failed to start trigger runtime");
            }
        }
        info!(count = self.running.len(), "trigger runtimes started");
        Ok(())
    }

    /// Stop every managed runtime in parallel, then dispose each. Errors
    /// are logged, never propagated.
    pub async fn stop_all(&self) {
        let entries: Vec<(TriggerDefId, ManagedTrigger)> = {
            let keys: Vec<TriggerDefId> =
                self.running.iter().map(|e| e.key().clone()).collect();
            keys.into_iter()
                .filter_map(|k| self.running.remove(&k))
                .collect()
        };

        let stops = entries.iter().map(|(id, managed)| {
            let id = id.clone();
            let runtime = managed.runtime.clone();
            async move {
                if let Err(e) = runtime.stop().await {
                    warn!(trigger = %id, error = %e, "trigger stop failed");
                }
            }
        });
        join_all(stops).await;

        for (id, managed) in entries {
            if let Err(e) = managed.runtime.dispose().await {
                warn!(trigger = %id, error = %e, "trigger dispose failed");
            }
        }
        info!("trigger runtimes stopped");
    }

    /// Stop the prior runtime (if any) and start again from the current
    /// definition. A missing or disabled definition leaves the trigger
    /// removed.
    #[instrument(skip(self))]
    pub async fn reload_trigger(self: &Arc<Self>, id: &TriggerDefId) -> Result<(), TriggerError> {
        if let Some((_, managed)) = self.running.remove(id) {
            if let Err(e) = managed.runtime.stop().await {
                warn!(trigger = %id, error = %e, "trigger stop failed during reload");
            }
            if let Err(e) = managed.runtime.dispose().await {
                warn!(trigger = %id, error = %e, "trigger dispose failed during reload");
            }
        }

        match self.store.trigger_definition(id).await? {
            Some(def) if def.is_enabled => self.start_trigger(&def).await,
            _ => Ok(()),
        }
    }

    /// Push a config change into a running runtime, or reload it when the
    /// runtime cannot absorb changes in place.
    pub async fn notify_config_change(
        self: &Arc<Self>,
        id: &TriggerDefId,
        config: &serde_json::Value,
    ) -> Result<(), TriggerError> {
        let hot = self
            .running
            .get(id)
            .filter(|m| m.runtime.supports_config_change())
            .map(|m| m.runtime.clone());

        match hot {
            Some(runtime) => {
                let decrypted = self.cipher.decrypt(config)?;
                runtime.on_config_change(&decrypted).await?;
                Ok(())
            }
            None => self.reload_trigger(id).await,
        }
    }

    /// Fire a trigger on behalf of its runtime, sandwiched by audit entries.
    pub async fn fire_trigger(
        &self,
        id: &TriggerDefId,
        payload: TriggerPayload,
    ) -> Result<TriggerEventId, TriggerError> {
        let (plugin_name, capability_key) = self
            .running
            .get(id)
            .map(|m| {
                (
                    m.cap_ref.plugin_name.clone(),
                    m.cap_ref.capability.key.clone(),
                )
            })
            .unwrap_or_else(|| ("unknown".to_owned(), "unknown".to_owned()));

        self.audit
            .record_trigger(TriggerAuditEntry {
                definition_id: id.clone(),
                plugin_name: plugin_name.clone(),
                capability_key: capability_key.clone(),
                phase: AuditPhase::Started,
                trigger_event_id: None,
                message: None,
                at: Utc::now(),
            })
            .await;

        match self.runner.fire_trigger_once(id, payload).await {
            Ok(event_id) => {
                self.audit
                    .record_trigger(TriggerAuditEntry {
                        definition_id: id.clone(),
                        plugin_name,
                        capability_key,
                        phase: AuditPhase::Succeeded,
                        trigger_event_id: Some(event_id.clone()),
                        message: None,
                        at: Utc::now(),
                    })
                    .await;
                Ok(event_id)
            }
            Err(e) => {
                self.audit
                    .record_trigger(TriggerAuditEntry {
                        definition_id: id.clone(),
                        plugin_name,
                        capability_key,
                        phase: AuditPhase::Failed,
                        trigger_event_id: None,
                        message: Some(e.to_string()),
                        at: Utc::now(),
                    })
                    .await;
                Err(e)
            }
        }
    }

    /// Resolve the capability, build the runtime context with an emit wired
    /// back to [`fire_trigger`](Self::fire_trigger), instantiate, and start.
    async fn start_trigger(self: &Arc<Self>, def: &TriggerDefinition) -> Result<(), TriggerError> {
        let cap_ref = self.registry.require_trigger_by_id(&def.capability_id)?;

        let weak = Arc::downgrade(self);
        let def_id = def.id.clone();
        let emit: EmitFn = Arc::new(
            move |payload| -> futures::future::BoxFuture<
                'static,
                Result<TriggerEventId, PluginServiceError>,
            > {
                let weak = weak.clone();
                let def_id = def_id.clone();
                Box::pin(async move {
                    let manager = weak.upgrade().ok_or_else(|| {
                        PluginServiceError::fatal("MANAGER_STOPPED", "trigger manager is shut down")
                    })?;
                    manager
                        .fire_trigger(&def_id, payload)
                        .await
                        .map_err(|e| PluginServiceError::fatal("EMIT_FAILED", e.to_string()))
                })
            },
        );

        let services = self.registry.create_trigger_services(&cap_ref, emit);
        let ctx = RuntimeContext {
            definition_id: def.id.to_string(),
            capability: cap_ref.capability.clone(),
            plugin_name: cap_ref.plugin_name.clone(),
            config: self.cipher.decrypt(&def.config)?,
            secrets: None,
            services,
        };

        let runtime: Arc<dyn TriggerRuntime> =
            Arc::from(self.registry.instantiate_trigger(&cap_ref, ctx)?);
        runtime.start().await?;

        self.running.insert(
            def.id.clone(),
            ManagedTrigger {
                cap_ref,
                runtime,
            },
        );
        info!(trigger = %def.id, "trigger runtime started");
        Ok(())
    }
}
