//! Plugin registry and runtime contracts.
//!
//! A plugin declares **capabilities**; each enabled capability can be
//! parameterized by persisted definitions and instantiated into a runtime:
//! a [`TriggerRuntime`] that is started/stopped by the trigger manager and
//! emits firings, or an [`ActionRuntime`] that the consumer executes per
//! message. Factories return a [`RuntimeHandle`] sum type; the registry
//! validates the variant against the capability kind at instantiation time.

mod audit;
mod error;
mod registry;
mod runtime;
mod service_error;

pub use audit::{
    ActionAuditEntry, AuditPhase, MemoryAuditSink, RuntimeAuditSink, TracingAuditSink,
    TriggerAuditEntry,
};
pub use error::PluginError;
pub use registry::{CapabilityRef, PluginRegistry};
pub use runtime::{
    ActionInput, ActionRuntime, EmitFn, ExecuteResult, InvocationInfo, RuntimeContext,
    RuntimeFactory, RuntimeHandle, RuntimeServices, TriggerPayload, TriggerRuntime,
};
pub use service_error::{ActionError, PluginServiceError, ServiceErrorKind};
