//! Behavioural tests of the in-memory reference store.

use chrono::Utc;

use latchflow_core::{
    ActionDefId, ActionDefinition, ActorRef, Bundle, BundleAssignment, BundleId, BundleObject,
    FileId, FileRecord, InvocationStatus, MagicLink, Pipeline, PipelineId, PipelineStep,
    PipelineTrigger, Recipient, TriggerDefId, TriggerDefinition, UserId,
};
use latchflow_store::{
    AuthStore, BundleStore, ChangeLogStore, DefinitionStore, FileStore, HistoryConfig,
    InvocationOutcome, MemoryStore, NewDownloadEvent, NewInvocation, PipelineStore,
    RecipientStore, RunStore, StoreError,
};

fn actor() -> ActorRef {
    ActorRef::user(UserId::new("admin-1"))
}

fn trigger_def(id: &str, enabled: bool) -> TriggerDefinition {
    TriggerDefinition {
        id: TriggerDefId::new(id),
        capability_id: "cap-trigger".into(),
        name: format!("trigger {id}"),
        config: serde_json::json!({}),
        is_enabled: enabled,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        created_by: UserId::new("admin-1"),
        updated_by: UserId::new("admin-1"),
    }
}

fn action_def(id: &str, enabled: bool) -> ActionDefinition {
    ActionDefinition {
        id: ActionDefId::new(id),
        capability_id: "cap-action".into(),
        name: format!("action {id}"),
        config: serde_json::json!({}),
        is_enabled: enabled,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        created_by: UserId::new("admin-1"),
        updated_by: UserId::new("admin-1"),
    }
}

fn pipeline(id: &str, enabled: bool) -> Pipeline {
    Pipeline {
        id: PipelineId::new(id),
        name: format!("pipeline {id}"),
        description: None,
        is_enabled: enabled,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn step(id: &str, pipeline: &str, action: &str, sort: i32, enabled: bool) -> PipelineStep {
    PipelineStep {
        id: id.to_owned(),
        pipeline_id: PipelineId::new(pipeline),
        action_id: ActionDefId::new(action),
        sort_order: sort,
        is_enabled: enabled,
    }
}

fn attachment(id: &str, pipeline: &str, trigger: &str, sort: i32) -> PipelineTrigger {
    PipelineTrigger {
        id: id.to_owned(),
        pipeline_id: PipelineId::new(pipeline),
        trigger_id: TriggerDefId::new(trigger),
        sort_order: sort,
        is_enabled: true,
    }
}

async fn seed_fanout(store: &MemoryStore) {
    let a = actor();
    store
        .create_trigger_definition(trigger_def("t-1", true), &a)
        .await
        .unwrap();
    for action in ["a-1", "a-2", "a-3", "a-disabled"] {
        store
            .create_action_definition(action_def(action, action != "a-disabled"), &a)
            .await
            .unwrap();
    }
    store.create_pipeline(pipeline("p-1", true), &a).await.unwrap();
    store.create_pipeline(pipeline("p-2", true), &a).await.unwrap();

    // p-1 fans out second despite being created first: attachment sort order rules.
    store
        .attach_trigger(attachment("at-1", "p-1", "t-1", 2), &a)
        .await
        .unwrap();
    store
        .attach_trigger(attachment("at-2", "p-2", "t-1", 1), &a)
        .await
        .unwrap();

    store
        .add_pipeline_step(step("s-12", "p-1", "a-2", 2, true), &a)
        .await
        .unwrap();
    store
        .add_pipeline_step(step("s-11", "p-1", "a-1", 1, true), &a)
        .await
        .unwrap();
    store
        .add_pipeline_step(step("s-21", "p-2", "a-3", 1, true), &a)
        .await
        .unwrap();
    store
        .add_pipeline_step(step("s-22", "p-2", "a-disabled", 2, true), &a)
        .await
        .unwrap();
}

#[tokio::test]
async fn fanout_orders_by_attachment_then_step_sort_order() {
    let store = MemoryStore::new();
    seed_fanout(&store).await;

    let resolved = store.resolve_fanout(&TriggerDefId::new("t-1")).await.unwrap();
    let actions: Vec<&str> = resolved
        .iter()
        .map(|s| s.action_definition_id.as_str())
        .collect();
    // p-2 first (attachment sort 1), then p-1's steps in step order. The
    // disabled action is silently skipped.
    assert_eq!(actions, ["a-3", "a-1", "a-2"]);
}

#[tokio::test]
async fn fanout_skips_disabled_pipeline() {
    let store = MemoryStore::new();
    seed_fanout(&store).await;

    let mut p = store.pipeline(&PipelineId::new("p-2")).await.unwrap().unwrap();
    p.is_enabled = false;
    store.update_pipeline(p, &actor()).await.unwrap();

    let resolved = store.resolve_fanout(&TriggerDefId::new("t-1")).await.unwrap();
    let actions: Vec<&str> = resolved
        .iter()
        .map(|s| s.action_definition_id.as_str())
        .collect();
    assert_eq!(actions, ["a-1", "a-2"]);
}

#[tokio::test]
async fn invocation_is_finalized_exactly_once() {
    let store = MemoryStore::new();
    store
        .create_action_definition(action_def("a-1", true), &actor())
        .await
        .unwrap();

    let invocation = store
        .create_invocation(NewInvocation {
            action_definition_id: ActionDefId::new("a-1"),
            trigger_event_id: None,
            manual_invoker_id: None,
            attempt: 1,
        })
        .await
        .unwrap();
    assert_eq!(invocation.status, InvocationStatus::Pending);

    let finalized = store
        .finalize_invocation(
            &invocation.id,
            InvocationOutcome {
                status: InvocationStatus::Success,
                result: Some(serde_json::json!({"ok": true})),
                retry_at: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(finalized.status, InvocationStatus::Success);
    assert!(finalized.completed_at.is_some());

    let err = store
        .finalize_invocation(
            &invocation.id,
            InvocationOutcome {
                status: InvocationStatus::Failed,
                result: None,
                retry_at: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
}

#[tokio::test]
async fn delete_refuses_while_dependents_exist() {
    let store = MemoryStore::new();
    seed_fanout(&store).await;

    let err = store
        .delete_action_definition(&ActionDefId::new("a-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InUse { .. }));

    let err = store
        .delete_trigger_definition(&TriggerDefId::new("t-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InUse { .. }));

    let err = store.delete_pipeline(&PipelineId::new("p-1")).await.unwrap_err();
    assert!(matches!(err, StoreError::InUse { .. }));

    // Removing the dependents unblocks the delete.
    store.remove_pipeline_step("s-11", &actor()).await.unwrap();
    store.remove_pipeline_step("s-12", &actor()).await.unwrap();
    store.detach_trigger("at-1", &actor()).await.unwrap();
    store.delete_pipeline(&PipelineId::new("p-1")).await.unwrap();
}

fn seed_file(id: &str, key: &str) -> FileRecord {
    FileRecord {
        id: FileId::new(id),
        key: key.to_owned(),
        storage_key: format!("objects/sha256/aa/bb/{id}"),
        size: 3,
        content_type: "text/plain".into(),
        content_hash: "ab".repeat(32),
        etag: None,
        metadata: Default::default(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn seed_bundle(id: &str) -> Bundle {
    Bundle {
        id: BundleId::new(id),
        name: format!("bundle {id}"),
        description: None,
        storage_path: String::new(),
        checksum: String::new(),
        bundle_digest: String::new(),
        is_enabled: true,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[tokio::test]
async fn file_delete_refuses_while_bundled() {
    let store = MemoryStore::new();
    let a = actor();
    store.create_file(seed_file("f-1", "docs/a.txt")).await.unwrap();
    store.create_bundle(seed_bundle("b-1"), &a).await.unwrap();
    store
        .add_bundle_object(
            BundleObject {
                id: "bo-1".into(),
                bundle_id: BundleId::new("b-1"),
                file_id: FileId::new("f-1"),
                sort_order: 1,
                required: true,
                is_enabled: true,
            },
            &a,
        )
        .await
        .unwrap();

    let err = store.delete_file(&FileId::new("f-1")).await.unwrap_err();
    assert!(matches!(err, StoreError::InUse { .. }));
}

#[tokio::test]
async fn concurrent_download_admissions_serialize() {
    let store = MemoryStore::new();
    let a = actor();
    store.create_bundle(seed_bundle("b-1"), &a).await.unwrap();
    store
        .create_recipient(
            Recipient {
                id: "r-1".into(),
                email: "one@example.com".into(),
                name: None,
                is_enabled: true,
                created_at: Utc::now(),
            },
            &a,
        )
        .await
        .unwrap();
    let assignment = BundleAssignment {
        id: "as-1".into(),
        bundle_id: BundleId::new("b-1"),
        recipient_id: "r-1".into(),
        is_enabled: true,
        max_downloads: Some(1),
        cooldown_seconds: None,
        last_download_at: None,
        verification_met: true,
        created_at: Utc::now(),
    };
    store.create_assignment(assignment.clone()).await.unwrap();

    // Two concurrent guard transactions: the second must observe the first's
    // committed event.
    let s1 = store.clone();
    let s2 = store.clone();
    let admit = |s: MemoryStore| async move {
        let tx = s.begin_download(&"as-1".into()).await.unwrap();
        let used = tx.download_count().await.unwrap();
        if used >= 1 {
            return false;
        }
        tx.commit(NewDownloadEvent {
            downloaded_at: Utc::now(),
            ip: "127.0.0.1".into(),
            user_agent: "test".into(),
        })
        .await
        .unwrap();
        true
    };
    let (first, second) = tokio::join!(admit(s1), admit(s2));
    assert_ne!(first, second, "exactly one admission must succeed");

    let events = store.download_events(&"as-1".into()).await.unwrap();
    assert_eq!(events.len(), 1);
    let row = store.assignment(&"as-1".into()).await.unwrap().unwrap();
    assert!(row.last_download_at.is_some());
}

#[tokio::test]
async fn magic_link_consumes_exactly_once() {
    let store = MemoryStore::new();
    let user = store.upsert_user_by_email("Admin@Example.com").await.unwrap();
    assert_eq!(user.email, "admin@example.com");

    let link = MagicLink {
        id: "ml-1".into(),
        user_id: user.id.clone(),
        token_hash: "h".repeat(64),
        expires_at: Utc::now() + chrono::Duration::minutes(15),
        consumed_at: None,
        created_at: Utc::now(),
    };
    store.create_magic_link(link.clone()).await.unwrap();

    let consumed = store
        .consume_magic_link(&link.token_hash, Utc::now())
        .await
        .unwrap();
    assert!(consumed.consumed_at.is_some());

    let err = store
        .consume_magic_link(&link.token_hash, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Consumed(_)));
}

#[tokio::test]
async fn expired_magic_link_is_rejected() {
    let store = MemoryStore::new();
    let user = store.upsert_user_by_email("a@b.com").await.unwrap();
    store
        .create_magic_link(MagicLink {
            id: "ml-2".into(),
            user_id: user.id,
            token_hash: "e".repeat(64),
            expires_at: Utc::now() - chrono::Duration::seconds(1),
            consumed_at: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    let err = store
        .consume_magic_link(&"e".repeat(64), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Expired(_)));
}

#[tokio::test]
async fn changelog_materializes_every_historical_version() {
    // A small snapshot interval forces snapshot+delta mixing quickly.
    let store = MemoryStore::with_history(HistoryConfig {
        snapshot_interval: 3,
        max_chain_depth: 200,
    });
    let a = actor();

    let mut def = trigger_def("t-hist", true);
    store.create_trigger_definition(def.clone(), &a).await.unwrap();

    // Capture the expected state at each version as we mutate.
    let mut expected = vec![serde_json::to_value(&def).unwrap()];
    for i in 0..9 {
        def.name = format!("renamed {i}");
        def.is_enabled = i % 2 == 0;
        def.config = serde_json::json!({"rev": i});
        store.update_trigger_definition(def.clone(), &a).await.unwrap();
        expected.push(serde_json::to_value(&def).unwrap());
    }

    let rows = store.history("trigger_definition", "t-hist").await.unwrap();
    assert_eq!(rows.len(), 10);
    assert!(rows[0].is_snapshot);
    // Interval 3: snapshots at versions 1, 4, 7, 10.
    let snapshot_versions: Vec<u64> = rows
        .iter()
        .filter(|r| r.is_snapshot)
        .map(|r| r.version)
        .collect();
    assert_eq!(snapshot_versions, [1, 4, 7, 10]);

    for (idx, want) in expected.iter().enumerate() {
        let got = store
            .materialize("trigger_definition", "t-hist", idx as u64 + 1)
            .await
            .unwrap();
        assert_eq!(&got, want, "version {} mismatch", idx + 1);
    }
}

#[tokio::test]
async fn changelog_rejects_unknown_versions() {
    let store = MemoryStore::new();
    store
        .create_trigger_definition(trigger_def("t-1", true), &actor())
        .await
        .unwrap();
    for version in [0u64, 2, 99] {
        let err = store
            .materialize("trigger_definition", "t-1", version)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionNotFound { .. }));
    }
}

#[tokio::test]
async fn assignment_uniqueness_is_enforced() {
    let store = MemoryStore::new();
    let a = actor();
    store.create_bundle(seed_bundle("b-1"), &a).await.unwrap();
    store
        .create_recipient(
            Recipient {
                id: "r-1".into(),
                email: "one@example.com".into(),
                name: None,
                is_enabled: true,
                created_at: Utc::now(),
            },
            &a,
        )
        .await
        .unwrap();

    let make = |id: &str| BundleAssignment {
        id: id.into(),
        bundle_id: BundleId::new("b-1"),
        recipient_id: "r-1".into(),
        is_enabled: true,
        max_downloads: None,
        cooldown_seconds: None,
        last_download_at: None,
        verification_met: false,
        created_at: Utc::now(),
    };
    store.create_assignment(make("as-1")).await.unwrap();
    let err = store.create_assignment(make("as-2")).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
}
