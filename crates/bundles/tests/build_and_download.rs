//! Scheduler and download-guard behaviour over in-memory storage and store.

use std::io::{Cursor, Read};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;

use latchflow_bundles::{
    BuildState, BundleScheduler, DownloadError, DownloadGuard, SchedulerConfig,
};
use latchflow_core::{
    ActorRef, Bundle, BundleAssignment, BundleId, BundleObject, FileId, FileRecord, RecipientId,
    Recipient, UserId,
};
use latchflow_storage::{MemoryStorageDriver, StorageService};
use latchflow_store::{BundleStore, FileStore, MemoryStore, RecipientStore};

struct Harness {
    store: MemoryStore,
    storage: StorageService,
    driver: Arc<MemoryStorageDriver>,
    scheduler: BundleScheduler,
    guard: DownloadGuard,
}

fn harness() -> Harness {
    let store = MemoryStore::new();
    let driver = Arc::new(MemoryStorageDriver::new());
    let storage = StorageService::new(driver.clone(), "test-bucket", "lf");
    let scheduler = BundleScheduler::new(
        Arc::new(store.clone()),
        storage.clone(),
        SchedulerConfig {
            debounce: Duration::from_millis(10),
        },
    );
    let guard = DownloadGuard::new(Arc::new(store.clone()), scheduler.clone());
    Harness {
        store,
        storage,
        driver,
        scheduler,
        guard,
    }
}

fn actor() -> ActorRef {
    ActorRef::user(UserId::new("admin"))
}

async fn seed_file(h: &Harness, id: &str, key: &str, content: &[u8]) {
    let put = h
        .storage
        .put_file(Bytes::copy_from_slice(content), "text/plain")
        .await
        .unwrap();
    h.store
        .create_file(FileRecord {
            id: FileId::new(id),
            key: key.to_owned(),
            storage_key: put.storage_key,
            size: put.size,
            content_type: "text/plain".into(),
            content_hash: put.sha256,
            etag: put.storage_etag,
            metadata: Default::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();
}

async fn seed_bundle(h: &Harness, id: &str, files: &[(&str, i32)]) {
    h.store
        .create_bundle(
            Bundle {
                id: BundleId::new(id),
                name: id.to_owned(),
                description: None,
                storage_path: String::new(),
                checksum: String::new(),
                bundle_digest: String::new(),
                is_enabled: true,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            &actor(),
        )
        .await
        .unwrap();
    for (file, sort) in files {
        h.store
            .add_bundle_object(
                BundleObject {
                    id: format!("bo-{file}"),
                    bundle_id: BundleId::new(id),
                    file_id: FileId::new(*file),
                    sort_order: *sort,
                    required: true,
                    is_enabled: true,
                },
                &actor(),
            )
            .await
            .unwrap();
    }
}

async fn build_and_wait(h: &Harness, id: &str) -> Bundle {
    let bundle_id = BundleId::new(id);
    h.scheduler.schedule(&bundle_id, false);
    h.scheduler.wait_idle(&bundle_id).await;
    h.store.bundle(&bundle_id).await.unwrap().unwrap()
}

#[tokio::test]
async fn build_commits_pointer_and_readable_archive() {
    let h = harness();
    seed_file(&h, "f-1", "docs/a.txt", b"alpha").await;
    seed_file(&h, "f-2", "docs/b.txt", b"bravo").await;
    seed_bundle(&h, "b-1", &[("f-1", 1), ("f-2", 2)]).await;

    let bundle = build_and_wait(&h, "b-1").await;
    assert!(!bundle.storage_path.is_empty());
    assert_eq!(bundle.bundle_digest.len(), 64);
    assert!(!bundle.checksum.is_empty());

    let archive = h.storage.get_file_bytes(&bundle.storage_path).await.unwrap();
    let mut zip = zip::ZipArchive::new(Cursor::new(archive.to_vec())).unwrap();
    let names: Vec<String> = (0..zip.len())
        .map(|i| zip.by_index(i).unwrap().name().to_owned())
        .collect();
    assert_eq!(names, ["docs/a.txt", "docs/b.txt"]);
    let mut body = String::new();
    zip.by_name("docs/a.txt")
        .unwrap()
        .read_to_string(&mut body)
        .unwrap();
    assert_eq!(body, "alpha");

    let status = h.scheduler.get_status(&BundleId::new("b-1"));
    assert_eq!(status.state, BuildState::Idle);
    assert_eq!(status.last.unwrap().digest, bundle.bundle_digest);
}

#[tokio::test]
async fn unchanged_digest_skips_rewrite() {
    let h = harness();
    seed_file(&h, "f-1", "docs/a.txt", b"alpha").await;
    seed_bundle(&h, "b-1", &[("f-1", 1)]).await;

    let first = build_and_wait(&h, "b-1").await;
    let objects_after_first = h.driver.len();

    let second = build_and_wait(&h, "b-1").await;
    assert_eq!(first.bundle_digest, second.bundle_digest);
    assert_eq!(first.updated_at, second.updated_at, "no rewrite happened");
    assert_eq!(h.driver.len(), objects_after_first);
}

#[tokio::test]
async fn disabling_an_object_changes_digest_and_pointer() {
    let h = harness();
    seed_file(&h, "f-1", "docs/a.txt", b"alpha").await;
    seed_file(&h, "f-2", "docs/b.txt", b"bravo").await;
    seed_bundle(&h, "b-1", &[("f-1", 1), ("f-2", 2)]).await;

    let before = build_and_wait(&h, "b-1").await;

    let mut object = h
        .store
        .bundle_objects(&BundleId::new("b-1"))
        .await
        .unwrap()
        .into_iter()
        .find(|o| o.file_id == FileId::new("f-2"))
        .unwrap();
    object.is_enabled = false;
    h.store.update_bundle_object(object, &actor()).await.unwrap();

    let after = build_and_wait(&h, "b-1").await;
    assert_ne!(before.bundle_digest, after.bundle_digest);
    assert_ne!(before.storage_path, after.storage_path);

    let archive = h.storage.get_file_bytes(&after.storage_path).await.unwrap();
    let zip = zip::ZipArchive::new(Cursor::new(archive.to_vec())).unwrap();
    assert_eq!(zip.len(), 1);
}

#[tokio::test]
async fn rapid_requests_coalesce_into_one_build() {
    let h = harness();
    seed_file(&h, "f-1", "docs/a.txt", b"alpha").await;
    seed_bundle(&h, "b-1", &[("f-1", 1)]).await;

    let bundle_id = BundleId::new("b-1");
    for _ in 0..20 {
        h.scheduler.schedule(&bundle_id, false);
    }
    h.scheduler.wait_idle(&bundle_id).await;

    // One archive object plus the seeded file: coalesced to a single build.
    assert_eq!(h.driver.len(), 2);
}

#[tokio::test]
async fn missing_required_file_fails_the_build() {
    let h = harness();
    // Metadata row whose storage object never existed.
    h.store
        .create_file(FileRecord {
            id: FileId::new("f-ghost"),
            key: "ghost.txt".into(),
            storage_key: "lf/objects/sha256/00/00/ghost".into(),
            size: 5,
            content_type: "text/plain".into(),
            content_hash: "00".repeat(32),
            etag: None,
            metadata: Default::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();
    seed_bundle(&h, "b-1", &[("f-ghost", 1)]).await;

    let bundle_id = BundleId::new("b-1");
    h.scheduler.schedule(&bundle_id, false);
    h.scheduler.wait_idle(&bundle_id).await;

    let status = h.scheduler.get_status(&bundle_id);
    assert_eq!(status.state, BuildState::Failed);
    assert!(status.last_error.unwrap().contains("f-ghost"));

    // Next request retries.
    let bundle = h.store.bundle(&bundle_id).await.unwrap().unwrap();
    assert!(bundle.storage_path.is_empty());
}

async fn seed_assignment(
    h: &Harness,
    id: &str,
    max_downloads: Option<u32>,
    cooldown_seconds: Option<u32>,
) {
    h.store
        .create_recipient(
            Recipient {
                id: RecipientId::new("r-1"),
                email: "r@example.com".into(),
                name: None,
                is_enabled: true,
                created_at: Utc::now(),
            },
            &actor(),
        )
        .await
        .unwrap();
    h.store
        .create_assignment(BundleAssignment {
            id: id.into(),
            bundle_id: BundleId::new("b-1"),
            recipient_id: RecipientId::new("r-1"),
            is_enabled: true,
            max_downloads,
            cooldown_seconds,
            last_download_at: None,
            verification_met: true,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn concurrent_downloads_respect_quota_of_one() {
    let h = harness();
    seed_file(&h, "f-1", "docs/a.txt", b"alpha").await;
    seed_bundle(&h, "b-1", &[("f-1", 1)]).await;
    build_and_wait(&h, "b-1").await;
    seed_assignment(&h, "as-1", Some(1), None).await;

    let g1 = &h.guard;
    let g2 = &h.guard;
    let id: latchflow_core::AssignmentId = "as-1".into();
    let (a, b) = tokio::join!(
        g1.authorize(&id, Utc::now(), "10.0.0.1", "ua-a"),
        g2.authorize(&id, Utc::now(), "10.0.0.2", "ua-b"),
    );

    let successes = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one admission");
    let denied = if a.is_err() { a.unwrap_err() } else { b.unwrap_err() };
    assert!(matches!(denied, DownloadError::QuotaExceeded { used: 1, max: 1 }));

    let events = h.store.download_events(&id).await.unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn cooldown_blocks_then_releases() {
    let h = harness();
    seed_file(&h, "f-1", "docs/a.txt", b"alpha").await;
    seed_bundle(&h, "b-1", &[("f-1", 1)]).await;
    build_and_wait(&h, "b-1").await;
    seed_assignment(&h, "as-1", None, Some(30)).await;

    let id: latchflow_core::AssignmentId = "as-1".into();
    let t0 = Utc::now();
    h.guard.authorize(&id, t0, "10.0.0.1", "ua").await.unwrap();

    let err = h
        .guard
        .authorize(&id, t0 + chrono::Duration::seconds(5), "10.0.0.1", "ua")
        .await
        .unwrap_err();
    match err {
        DownloadError::CooldownActive { retry_after_secs } => {
            assert!(retry_after_secs >= 20 && retry_after_secs <= 25);
        }
        other => panic!("expected cooldown, got {other:?}"),
    }

    let admitted = h
        .guard
        .authorize(&id, t0 + chrono::Duration::seconds(31), "10.0.0.1", "ua")
        .await
        .unwrap();
    // Two successful downloads at least the cooldown apart.
    let events = h.store.download_events(&id).await.unwrap();
    assert_eq!(events.len(), 2);
    let gap = admitted.event.downloaded_at - events[0].downloaded_at;
    assert!(gap >= chrono::Duration::seconds(30));
}

#[tokio::test]
async fn disabled_assignment_and_missing_assignment_are_forbidden() {
    let h = harness();
    seed_file(&h, "f-1", "docs/a.txt", b"alpha").await;
    seed_bundle(&h, "b-1", &[("f-1", 1)]).await;
    build_and_wait(&h, "b-1").await;
    seed_assignment(&h, "as-1", None, None).await;

    let ghost: latchflow_core::AssignmentId = "as-ghost".into();
    assert!(matches!(
        h.guard.authorize(&ghost, Utc::now(), "ip", "ua").await.unwrap_err(),
        DownloadError::Forbidden
    ));

    let id: latchflow_core::AssignmentId = "as-1".into();
    let mut assignment = h.store.assignment(&id).await.unwrap().unwrap();
    assignment.is_enabled = false;
    h.store.update_assignment(assignment).await.unwrap();
    assert!(matches!(
        h.guard.authorize(&id, Utc::now(), "ip", "ua").await.unwrap_err(),
        DownloadError::Forbidden
    ));
}

#[tokio::test]
async fn unbuilt_bundle_yields_no_storage_path_after_event_commit() {
    let h = harness();
    seed_file(&h, "f-1", "docs/a.txt", b"alpha").await;
    seed_bundle(&h, "b-1", &[("f-1", 1)]).await;
    seed_assignment(&h, "as-1", None, None).await;

    let id: latchflow_core::AssignmentId = "as-1".into();
    let err = h.guard.authorize(&id, Utc::now(), "ip", "ua").await.unwrap_err();
    assert!(matches!(err, DownloadError::NoStoragePath));

    // The admission committed before pointer resolution.
    assert_eq!(h.store.download_events(&id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn digest_drift_triggers_lazy_rebuild() {
    let h = harness();
    seed_file(&h, "f-1", "docs/a.txt", b"alpha").await;
    seed_file(&h, "f-2", "docs/b.txt", b"bravo").await;
    seed_bundle(&h, "b-1", &[("f-1", 1), ("f-2", 2)]).await;
    let before = build_and_wait(&h, "b-1").await;

    // Disable one object without rebuilding: the stored digest is now stale.
    let mut object = h
        .store
        .bundle_objects(&BundleId::new("b-1"))
        .await
        .unwrap()
        .into_iter()
        .find(|o| o.file_id == FileId::new("f-2"))
        .unwrap();
    object.is_enabled = false;
    h.store.update_bundle_object(object, &actor()).await.unwrap();

    let bundle_id = BundleId::new("b-1");
    h.guard.verify_digest(&bundle_id).await;
    h.scheduler.wait_idle(&bundle_id).await;

    let after = h.store.bundle(&bundle_id).await.unwrap().unwrap();
    assert_ne!(before.bundle_digest, after.bundle_digest);
    assert_ne!(before.storage_path, after.storage_path);
}
