use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use latchflow_core::{CapabilityId, CapabilityKind, PluginCapability, PluginId};

use crate::error::PluginError;
use crate::runtime::{
    ActionRuntime, EmitFn, RuntimeContext, RuntimeFactory, RuntimeHandle, RuntimeServices,
    TriggerRuntime,
};

/// One registered capability with its factory.
#[derive(Clone)]
pub struct CapabilityRef {
    pub plugin_name: String,
    pub plugin_id: PluginId,
    pub capability: PluginCapability,
    pub factory: Arc<dyn RuntimeFactory>,
}

impl std::fmt::Debug for CapabilityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRef")
            .field("plugin_name", &self.plugin_name)
            .field("capability", &self.capability.id)
            .field("kind", &self.capability.kind)
            .finish_non_exhaustive()
    }
}

/// Indexes capabilities by id and by `(plugin_name, key)` per kind.
#[derive(Default)]
pub struct PluginRegistry {
    by_id: DashMap<CapabilityId, Arc<CapabilityRef>>,
    by_key: DashMap<(String, CapabilityKind, String), CapabilityId>,
}

impl PluginRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a trigger capability.
    pub fn register_trigger(&self, cap_ref: CapabilityRef) -> Result<(), PluginError> {
        self.register(cap_ref, CapabilityKind::Trigger)
    }

    /// Register an action capability.
    pub fn register_action(&self, cap_ref: CapabilityRef) -> Result<(), PluginError> {
        self.register(cap_ref, CapabilityKind::Action)
    }

    fn register(&self, cap_ref: CapabilityRef, kind: CapabilityKind) -> Result<(), PluginError> {
        if cap_ref.capability.kind != kind {
            return Err(PluginError::InvalidRuntime {
                capability: cap_ref.capability.id.clone(),
                expected: kind_name(kind),
                got: kind_name(cap_ref.capability.kind),
            });
        }
        let id = cap_ref.capability.id.clone();
        let key = (
            cap_ref.plugin_name.clone(),
            kind,
            cap_ref.capability.key.clone(),
        );
        if self.by_id.contains_key(&id) || self.by_key.contains_key(&key) {
            return Err(PluginError::Duplicate(id));
        }
        debug!(
            plugin = %cap_ref.plugin_name,
            capability = %id,
            key = %cap_ref.capability.key,
            ?kind,
            "capability registered"
        );
        self.by_key.insert(key, id.clone());
        self.by_id.insert(id, Arc::new(cap_ref));
        Ok(())
    }

    /// Look up an enabled trigger capability by id.
    pub fn require_trigger_by_id(
        &self,
        id: &CapabilityId,
    ) -> Result<Arc<CapabilityRef>, PluginError> {
        self.require(id, CapabilityKind::Trigger)
    }

    /// Look up an enabled action capability by id.
    pub fn require_action_by_id(
        &self,
        id: &CapabilityId,
    ) -> Result<Arc<CapabilityRef>, PluginError> {
        self.require(id, CapabilityKind::Action)
    }

    fn require(
        &self,
        id: &CapabilityId,
        kind: CapabilityKind,
    ) -> Result<Arc<CapabilityRef>, PluginError> {
        let cap_ref = self
            .by_id
            .get(id)
            .map(|entry| entry.clone())
            .ok_or_else(|| PluginError::CapabilityNotFound(id.clone()))?;
        if cap_ref.capability.kind != kind {
            return Err(PluginError::CapabilityNotFound(id.clone()));
        }
        if !cap_ref.capability.is_enabled {
            return Err(PluginError::CapabilityDisabled(id.clone()));
        }
        Ok(cap_ref)
    }

    /// Look up a capability id by `(plugin_name, kind, key)`.
    pub fn capability_id(
        &self,
        plugin_name: &str,
        kind: CapabilityKind,
        key: &str,
    ) -> Option<CapabilityId> {
        self.by_key
            .get(&(plugin_name.to_owned(), kind, key.to_owned()))
            .map(|entry| entry.clone())
    }

    /// All registered capabilities.
    pub fn capabilities(&self) -> Vec<PluginCapability> {
        let mut caps: Vec<_> = self
            .by_id
            .iter()
            .map(|entry| entry.capability.clone())
            .collect();
        caps.sort_by(|a, b| a.id.cmp(&b.id));
        caps
    }

    /// Instantiate a trigger runtime, validating the factory's output shape.
    pub fn instantiate_trigger(
        &self,
        cap_ref: &CapabilityRef,
        ctx: RuntimeContext,
    ) -> Result<Box<dyn TriggerRuntime>, PluginError> {
        let handle = cap_ref
            .factory
            .create(ctx)
            .map_err(|e| PluginError::Factory {
                capability: cap_ref.capability.id.clone(),
                message: e.to_string(),
            })?;
        match handle {
            RuntimeHandle::Trigger(runtime) => Ok(runtime),
            other => Err(PluginError::InvalidRuntime {
                capability: cap_ref.capability.id.clone(),
                expected: "trigger",
                got: other.variant_name(),
            }),
        }
    }

    /// Instantiate an action runtime, validating the factory's output shape.
    pub fn instantiate_action(
        &self,
        cap_ref: &CapabilityRef,
        ctx: RuntimeContext,
    ) -> Result<Box<dyn ActionRuntime>, PluginError> {
        let handle = cap_ref
            .factory
            .create(ctx)
            .map_err(|e| PluginError::Factory {
                capability: cap_ref.capability.id.clone(),
                message: e.to_string(),
            })?;
        match handle {
            RuntimeHandle::Action(runtime) => Ok(runtime),
            other => Err(PluginError::InvalidRuntime {
                capability: cap_ref.capability.id.clone(),
                expected: "action",
                got: other.variant_name(),
            }),
        }
    }

    /// Services for an action invocation.
    #[must_use]
    pub fn create_runtime_services(&self, cap_ref: &CapabilityRef) -> RuntimeServices {
        RuntimeServices::new(format!("plugin::{}", cap_ref.plugin_name))
    }

    /// Services for a trigger runtime, wired with its emit closure.
    #[must_use]
    pub fn create_trigger_services(
        &self,
        cap_ref: &CapabilityRef,
        emit: EmitFn,
    ) -> RuntimeServices {
        RuntimeServices::with_emit(format!("plugin::{}", cap_ref.plugin_name), emit)
    }
}

fn kind_name(kind: CapabilityKind) -> &'static str {
    match kind {
        CapabilityKind::Trigger => "trigger",
        CapabilityKind::Action => "action",
    }
}
