//! Domain model and shared types for Latchflow.
//!
//! Latchflow distributes **bundles** (content-addressed archives of files)
//! to **recipients** through time- and quota-limited **assignments**; bundle
//! rebuilds and notifications are driven by a pluggable trigger→action
//! runtime. This crate holds the entities every other crate speaks in, plus
//! the shared error-code vocabulary of the HTTP surface.

pub mod auth;
pub mod bundle;
pub mod changelog;
pub mod codes;
pub mod definition;
pub mod event;
pub mod file;
pub mod invocation;
pub mod pipeline;
pub mod plugin;
pub mod recipient;
pub mod types;

pub use auth::{
    ApiToken, DeviceAuth, DeviceAuthStatus, MagicLink, RecipientOtp, RecipientSession, Session,
    User,
};
pub use bundle::{Bundle, BundleObject};
pub use changelog::{ActorRef, ActorType, ChangeKind, ChangeLogRow};
pub use definition::{ActionDefinition, TriggerDefinition};
pub use event::TriggerEvent;
pub use file::FileRecord;
pub use invocation::{ActionInvocation, InvocationStatus};
pub use pipeline::{Pipeline, PipelineStep, PipelineTrigger, ResolvedStep};
pub use plugin::{CapabilityKind, Plugin, PluginCapability};
pub use recipient::{BundleAssignment, DownloadEvent, Recipient};
pub use types::{
    ActionDefId, AssignmentId, BundleId, CapabilityId, DeviceAuthId, FileId, InvocationId,
    PipelineId, PluginId, RecipientId, TokenId, TriggerDefId, TriggerEventId, UserId,
};
