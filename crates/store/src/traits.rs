use async_trait::async_trait;
use chrono::{DateTime, Utc};

use latchflow_core::{
    ActionDefId, ActionDefinition, ActionInvocation, ActorRef, ApiToken, AssignmentId, Bundle,
    BundleAssignment, BundleId, BundleObject, ChangeLogRow, DeviceAuth, DeviceAuthId, DownloadEvent,
    FileId, FileRecord, InvocationId, InvocationStatus, MagicLink, Pipeline, PipelineId,
    PipelineStep, PipelineTrigger, Recipient, RecipientId, RecipientOtp, RecipientSession,
    ResolvedStep, Session, TokenId, TriggerDefId, TriggerDefinition, TriggerEvent, TriggerEventId,
    User, UserId,
};

use crate::download::DownloadTx;
use crate::error::StoreError;
use crate::history::AppendChange;

/// Trigger and action definition persistence.
///
/// Deletes refuse with [`StoreError::InUse`] while dependents exist
/// (pipeline attachments, steps, trigger events, invocations). Mutations
/// append a change-log row in the same critical section.
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    async fn trigger_definition(
        &self,
        id: &TriggerDefId,
    ) -> Result<Option<TriggerDefinition>, StoreError>;
    async fn list_trigger_definitions(&self) -> Result<Vec<TriggerDefinition>, StoreError>;
    async fn enabled_trigger_definitions(&self) -> Result<Vec<TriggerDefinition>, StoreError>;
    async fn create_trigger_definition(
        &self,
        def: TriggerDefinition,
        actor: &ActorRef,
    ) -> Result<(), StoreError>;
    async fn update_trigger_definition(
        &self,
        def: TriggerDefinition,
        actor: &ActorRef,
    ) -> Result<(), StoreError>;
    async fn delete_trigger_definition(&self, id: &TriggerDefId) -> Result<(), StoreError>;

    async fn action_definition(
        &self,
        id: &ActionDefId,
    ) -> Result<Option<ActionDefinition>, StoreError>;
    async fn list_action_definitions(&self) -> Result<Vec<ActionDefinition>, StoreError>;
    async fn create_action_definition(
        &self,
        def: ActionDefinition,
        actor: &ActorRef,
    ) -> Result<(), StoreError>;
    async fn update_action_definition(
        &self,
        def: ActionDefinition,
        actor: &ActorRef,
    ) -> Result<(), StoreError>;
    async fn delete_action_definition(&self, id: &ActionDefId) -> Result<(), StoreError>;
}

/// Pipeline, step, and trigger-attachment persistence plus fan-out
/// resolution.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    async fn pipeline(&self, id: &PipelineId) -> Result<Option<Pipeline>, StoreError>;
    async fn list_pipelines(&self) -> Result<Vec<Pipeline>, StoreError>;
    async fn create_pipeline(&self, pipeline: Pipeline, actor: &ActorRef)
    -> Result<(), StoreError>;
    async fn update_pipeline(&self, pipeline: Pipeline, actor: &ActorRef)
    -> Result<(), StoreError>;
    async fn delete_pipeline(&self, id: &PipelineId) -> Result<(), StoreError>;

    async fn pipeline_steps(&self, id: &PipelineId) -> Result<Vec<PipelineStep>, StoreError>;
    async fn add_pipeline_step(
        &self,
        step: PipelineStep,
        actor: &ActorRef,
    ) -> Result<(), StoreError>;
    async fn update_pipeline_step(
        &self,
        step: PipelineStep,
        actor: &ActorRef,
    ) -> Result<(), StoreError>;
    async fn remove_pipeline_step(&self, step_id: &str, actor: &ActorRef)
    -> Result<(), StoreError>;

    async fn attach_trigger(
        &self,
        attachment: PipelineTrigger,
        actor: &ActorRef,
    ) -> Result<(), StoreError>;
    async fn detach_trigger(
        &self,
        attachment_id: &str,
        actor: &ActorRef,
    ) -> Result<(), StoreError>;

    /// Resolve the fan-out target set of a trigger firing: enabled steps of
    /// enabled pipelines attached (enabled) to the trigger, whose actions are
    /// enabled, ordered by `(attachment.sort_order, step.sort_order)` with id
    /// tie-breaks.
    async fn resolve_fanout(
        &self,
        trigger_id: &TriggerDefId,
    ) -> Result<Vec<ResolvedStep>, StoreError>;
}

/// Input for persisting a trigger event.
#[derive(Debug, Clone)]
pub struct NewTriggerEvent {
    pub trigger_definition_id: TriggerDefId,
    pub context: Option<serde_json::Value>,
}

/// Input for materializing a PENDING invocation row.
#[derive(Debug, Clone)]
pub struct NewInvocation {
    pub action_definition_id: ActionDefId,
    pub trigger_event_id: Option<TriggerEventId>,
    pub manual_invoker_id: Option<UserId>,
    pub attempt: u32,
}

/// The single finalizing update of an invocation row.
#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    pub status: InvocationStatus,
    pub result: Option<serde_json::Value>,
    pub retry_at: Option<DateTime<Utc>>,
}

/// Trigger events and action invocations (the runtime's audit spine).
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn record_trigger_event(
        &self,
        event: NewTriggerEvent,
    ) -> Result<TriggerEvent, StoreError>;
    async fn trigger_event(&self, id: &TriggerEventId) -> Result<Option<TriggerEvent>, StoreError>;

    async fn create_invocation(&self, new: NewInvocation)
    -> Result<ActionInvocation, StoreError>;
    /// Apply the finalizing update. Fails if the row is already terminal --
    /// the consumer writes exactly one finalization per row.
    async fn finalize_invocation(
        &self,
        id: &InvocationId,
        outcome: InvocationOutcome,
    ) -> Result<ActionInvocation, StoreError>;
    async fn invocation(&self, id: &InvocationId) -> Result<Option<ActionInvocation>, StoreError>;
    async fn invocations_for_action(
        &self,
        action_id: &ActionDefId,
    ) -> Result<Vec<ActionInvocation>, StoreError>;
}

/// The atomic pointer update committed at the end of a successful build.
#[derive(Debug, Clone)]
pub struct BundlePointer {
    pub storage_path: String,
    pub checksum: String,
    pub bundle_digest: String,
    pub updated_at: DateTime<Utc>,
}

/// Bundle and bundle-object persistence.
#[async_trait]
pub trait BundleStore: Send + Sync {
    async fn bundle(&self, id: &BundleId) -> Result<Option<Bundle>, StoreError>;
    async fn list_bundles(&self) -> Result<Vec<Bundle>, StoreError>;
    async fn create_bundle(&self, bundle: Bundle, actor: &ActorRef) -> Result<(), StoreError>;
    async fn update_bundle(&self, bundle: Bundle, actor: &ActorRef) -> Result<(), StoreError>;
    async fn delete_bundle(&self, id: &BundleId) -> Result<(), StoreError>;

    /// Commit a built archive. Readers racing this observe either the old or
    /// the new pointer atomically.
    async fn commit_bundle_pointer(
        &self,
        id: &BundleId,
        pointer: BundlePointer,
    ) -> Result<Bundle, StoreError>;

    async fn bundle_objects(&self, id: &BundleId) -> Result<Vec<BundleObject>, StoreError>;
    /// The logical contents of the bundle: enabled objects joined with their
    /// files, ordered by `(sort_order, id)`.
    async fn enabled_bundle_objects_with_files(
        &self,
        id: &BundleId,
    ) -> Result<Vec<(BundleObject, FileRecord)>, StoreError>;
    async fn add_bundle_object(
        &self,
        object: BundleObject,
        actor: &ActorRef,
    ) -> Result<(), StoreError>;
    async fn update_bundle_object(
        &self,
        object: BundleObject,
        actor: &ActorRef,
    ) -> Result<(), StoreError>;

    /// Bundles whose enabled or disabled objects reference any of `files`.
    async fn bundles_containing_files(
        &self,
        files: &[FileId],
    ) -> Result<Vec<BundleId>, StoreError>;
}

/// File metadata persistence. The bytes live in object storage.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn file(&self, id: &FileId) -> Result<Option<FileRecord>, StoreError>;
    async fn file_by_key(&self, key: &str) -> Result<Option<FileRecord>, StoreError>;
    async fn list_files(&self) -> Result<Vec<FileRecord>, StoreError>;
    async fn create_file(&self, file: FileRecord) -> Result<(), StoreError>;
    async fn update_file(&self, file: FileRecord) -> Result<(), StoreError>;
    /// Refuses with [`StoreError::InUse`] while a bundle object references
    /// the file.
    async fn delete_file(&self, id: &FileId) -> Result<(), StoreError>;
}

/// Recipients, assignments, and download events.
#[async_trait]
pub trait RecipientStore: Send + Sync {
    async fn recipient(&self, id: &RecipientId) -> Result<Option<Recipient>, StoreError>;
    async fn recipient_by_email(&self, email: &str) -> Result<Option<Recipient>, StoreError>;
    async fn list_recipients(&self) -> Result<Vec<Recipient>, StoreError>;
    async fn create_recipient(
        &self,
        recipient: Recipient,
        actor: &ActorRef,
    ) -> Result<(), StoreError>;
    async fn update_recipient(
        &self,
        recipient: Recipient,
        actor: &ActorRef,
    ) -> Result<(), StoreError>;
    async fn delete_recipient(&self, id: &RecipientId) -> Result<(), StoreError>;

    async fn assignment(&self, id: &AssignmentId)
    -> Result<Option<BundleAssignment>, StoreError>;
    async fn assignment_for(
        &self,
        bundle: &BundleId,
        recipient: &RecipientId,
    ) -> Result<Option<BundleAssignment>, StoreError>;
    async fn assignments_for_bundle(
        &self,
        bundle: &BundleId,
    ) -> Result<Vec<BundleAssignment>, StoreError>;
    async fn assignments_for_recipient(
        &self,
        recipient: &RecipientId,
    ) -> Result<Vec<BundleAssignment>, StoreError>;
    /// Fails with [`StoreError::Conflict`] when `(bundle, recipient)` already
    /// has an assignment.
    async fn create_assignment(&self, assignment: BundleAssignment) -> Result<(), StoreError>;
    async fn update_assignment(&self, assignment: BundleAssignment) -> Result<(), StoreError>;
    async fn delete_assignment(&self, id: &AssignmentId) -> Result<(), StoreError>;

    async fn download_events(
        &self,
        assignment: &AssignmentId,
    ) -> Result<Vec<DownloadEvent>, StoreError>;

    /// Open the download-admission transaction for an assignment, locking it
    /// against concurrent admissions.
    async fn begin_download(
        &self,
        assignment: &AssignmentId,
    ) -> Result<Box<dyn DownloadTx>, StoreError>;
}

/// Authentication state: users, sessions, one-time credentials, API tokens.
///
/// Every secret is addressed by its SHA-256 hex hash; raw secrets never
/// reach this layer.
#[async_trait]
pub trait AuthStore: Send + Sync {
    async fn upsert_user_by_email(&self, email: &str) -> Result<User, StoreError>;
    async fn user(&self, id: &UserId) -> Result<Option<User>, StoreError>;

    async fn create_session(&self, session: Session) -> Result<(), StoreError>;
    async fn session_by_token_hash(&self, hash: &str) -> Result<Option<Session>, StoreError>;
    async fn revoke_session(&self, hash: &str) -> Result<(), StoreError>;

    async fn create_magic_link(&self, link: MagicLink) -> Result<(), StoreError>;
    /// Atomically consume an unexpired, unconsumed link: marks `consumed_at`
    /// and returns the row, or fails with [`StoreError::Consumed`] /
    /// [`StoreError::NotFound`].
    async fn consume_magic_link(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<MagicLink, StoreError>;

    /// Insert a fresh OTP for the recipient, deleting any older rows so at
    /// most one is active.
    async fn replace_recipient_otp(&self, otp: RecipientOtp) -> Result<(), StoreError>;
    async fn active_otp_for_recipient(
        &self,
        recipient: &RecipientId,
    ) -> Result<Option<RecipientOtp>, StoreError>;
    /// Bump the attempt counter, returning the new count.
    async fn increment_otp_attempts(&self, otp_id: &str) -> Result<u32, StoreError>;
    async fn delete_otp(&self, otp_id: &str) -> Result<(), StoreError>;

    async fn create_recipient_session(&self, session: RecipientSession)
    -> Result<(), StoreError>;
    async fn recipient_session_by_token_hash(
        &self,
        hash: &str,
    ) -> Result<Option<RecipientSession>, StoreError>;
    async fn revoke_recipient_session(&self, hash: &str) -> Result<(), StoreError>;

    async fn create_device_auth(&self, device: DeviceAuth) -> Result<(), StoreError>;
    async fn device_auth_by_device_code_hash(
        &self,
        hash: &str,
    ) -> Result<Option<DeviceAuth>, StoreError>;
    async fn device_auth_by_user_code_hash(
        &self,
        hash: &str,
    ) -> Result<Option<DeviceAuth>, StoreError>;
    async fn update_device_auth(&self, device: DeviceAuth) -> Result<(), StoreError>;
    async fn device_auth(&self, id: &DeviceAuthId) -> Result<Option<DeviceAuth>, StoreError>;

    async fn create_api_token(&self, token: ApiToken) -> Result<(), StoreError>;
    async fn api_token_by_hash(&self, hash: &str) -> Result<Option<ApiToken>, StoreError>;
    async fn api_tokens_for_user(&self, user: &UserId) -> Result<Vec<ApiToken>, StoreError>;
    async fn api_token(&self, id: &TokenId) -> Result<Option<ApiToken>, StoreError>;
    async fn update_api_token(&self, token: ApiToken) -> Result<(), StoreError>;
}

/// Append-only entity history.
#[async_trait]
pub trait ChangeLogStore: Send + Sync {
    /// Append one version. The store assigns the version number and decides
    /// snapshot-vs-delta per its [`HistoryConfig`](crate::HistoryConfig).
    async fn append_change(&self, change: AppendChange) -> Result<ChangeLogRow, StoreError>;

    /// All rows for an entity, ascending by version.
    async fn history(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<ChangeLogRow>, StoreError>;

    /// Reconstruct the entity state at `version`.
    async fn materialize(
        &self,
        entity_type: &str,
        entity_id: &str,
        version: u64,
    ) -> Result<serde_json::Value, StoreError>;
}

/// The full persistence surface the application wires against.
pub trait LatchflowStore:
    DefinitionStore
    + PipelineStore
    + RunStore
    + BundleStore
    + FileStore
    + RecipientStore
    + AuthStore
    + ChangeLogStore
{
}

impl<T> LatchflowStore for T where
    T: DefinitionStore
        + PipelineStore
        + RunStore
        + BundleStore
        + FileStore
        + RecipientStore
        + AuthStore
        + ChangeLogStore
{
}
