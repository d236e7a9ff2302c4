//! End-to-end HTTP scenarios against the full in-memory stack.

use std::sync::Arc;
use std::time::Duration;

use axum_test::TestServer;
use serde_json::json;

use latchflow_bundles::{BundleScheduler, DownloadGuard, SchedulerConfig};
use latchflow_core::BundleId;
use latchflow_crypto::{ConfigCipher, sha256_hex};
use latchflow_email::MemoryEmailProvider;
use latchflow_plugin::{PluginRegistry, TracingAuditSink};
use latchflow_queue::MemoryQueue;
use latchflow_server::api::{AppState, router};
use latchflow_server::auth::policy::{Compiled, DecisionLog};
use latchflow_server::auth::service::{AuthService, DeviceTokenCache};
use latchflow_server::config::LatchflowConfig;
use latchflow_server::ratelimit::RateLimiter;
use latchflow_storage::{MemoryStorageDriver, StorageService};
use latchflow_store::{AuthStore, BundleStore, LatchflowStore, MemoryStore};
use latchflow_triggers::{TriggerManager, TriggerRunner};

struct Harness {
    server: TestServer,
    store: Arc<MemoryStore>,
    email: Arc<MemoryEmailProvider>,
    scheduler: BundleScheduler,
}

fn harness_with(config: LatchflowConfig) -> Harness {
    let config = Arc::new(config);
    let store = Arc::new(MemoryStore::new());
    let storage = StorageService::new(Arc::new(MemoryStorageDriver::new()), "test-bucket", "lf");
    let queue = Arc::new(MemoryQueue::new());
    let email = Arc::new(MemoryEmailProvider::new());
    let registry = Arc::new(PluginRegistry::new());
    let audit = Arc::new(TracingAuditSink);
    let cipher = Arc::new(ConfigCipher::plaintext());

    let scheduler = BundleScheduler::new(
        store.clone(),
        storage.clone(),
        SchedulerConfig {
            debounce: Duration::from_millis(10),
        },
    );
    let guard = Arc::new(DownloadGuard::new(store.clone(), scheduler.clone()));
    let runner = Arc::new(TriggerRunner::new(store.clone(), queue.clone()));
    let manager = TriggerManager::new(
        store.clone(),
        registry.clone(),
        cipher.clone(),
        audit.clone(),
        runner,
    );
    let rate_limiter = Arc::new(RateLimiter::default());
    let device_tokens = Arc::new(DeviceTokenCache::new());
    let auth = Arc::new(AuthService::new(
        store.clone(),
        email.clone(),
        config.clone(),
        rate_limiter.clone(),
        device_tokens.clone(),
    ));

    let state = AppState {
        config,
        store: store.clone() as Arc<dyn LatchflowStore>,
        storage,
        queue,
        scheduler: scheduler.clone(),
        guard,
        manager,
        registry,
        email: email.clone(),
        auth,
        policy: Arc::new(Compiled::default()),
        authz_log: Arc::new(DecisionLog::default()),
        cipher,
        rate_limiter,
        device_tokens,
    };

    let server = TestServer::builder()
        .save_cookies()
        .build(router(state))
        .expect("test server");

    Harness {
        server,
        store,
        email,
        scheduler,
    }
}

fn harness() -> Harness {
    let config = LatchflowConfig {
        allow_dev_auth: true,
        device_code_interval: Duration::from_secs(0),
        ..LatchflowConfig::default()
    };
    harness_with(config)
}

/// Log in as an admin through the magic-link ceremony (dev mode).
async fn admin_login(h: &Harness) {
    let res = h
        .server
        .post("/auth/admin/start")
        .json(&json!({"email": "admin@example.com"}))
        .await;
    res.assert_status_ok();
    let body: serde_json::Value = res.json();
    let url = body["login_url"].as_str().expect("dev login url");
    let token = url.split("token=").nth(1).unwrap();

    let res = h
        .server
        .get("/auth/admin/callback")
        .add_query_param("token", token)
        .await;
    res.assert_status_ok();
}

/// Log in as a recipient via the OTP ceremony, pulling the code from the
/// email outbox.
async fn recipient_login(h: &Harness, email: &str) {
    let res = h
        .server
        .post("/auth/recipient/start")
        .json(&json!({"email": email}))
        .await;
    assert_eq!(res.status_code(), 204);

    let mail = h.email.last_to(email).expect("otp email delivered");
    let text = mail.text_body.unwrap();
    let otp: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .collect();
    assert!(!otp.is_empty(), "otp not found in email body: {text}");

    let res = h
        .server
        .post("/auth/recipient/verify")
        .json(&json!({"email": email, "otp": otp}))
        .await;
    res.assert_status_ok();
}

/// Create a recipient, a built two-file bundle, and an assignment.
async fn seed_downloadable_bundle(
    h: &Harness,
    max_downloads: Option<u32>,
    cooldown_seconds: Option<u32>,
) -> String {
    admin_login(h).await;

    let res = h
        .server
        .post("/recipients")
        .json(&json!({"email": "reader@example.com", "name": "Reader"}))
        .await;
    assert_eq!(res.status_code(), 201);
    let recipient: serde_json::Value = res.json();

    let mut file_ids = Vec::new();
    for (name, content) in [("docs/a.txt", "alpha"), ("docs/b.txt", "bravo")] {
        let res = h
            .server
            .post("/files/upload")
            .add_query_param("key", name)
            .add_query_param("content_type", "text/plain")
            .bytes(bytes::Bytes::from_static(content.as_bytes()))
            .await;
        assert_eq!(res.status_code(), 201);
        let file: serde_json::Value = res.json();
        file_ids.push(file["id"].as_str().unwrap().to_owned());
    }

    let res = h
        .server
        .post("/bundles")
        .json(&json!({"name": "quarterly-report"}))
        .await;
    assert_eq!(res.status_code(), 201);
    let bundle: serde_json::Value = res.json();
    let bundle_id = bundle["id"].as_str().unwrap().to_owned();

    for (i, file_id) in file_ids.iter().enumerate() {
        let res = h
            .server
            .post(&format!("/bundles/{bundle_id}/objects"))
            .json(&json!({"file_id": file_id, "sort_order": i as i32 + 1, "required": true}))
            .await;
        assert_eq!(res.status_code(), 201);
    }

    h.scheduler.wait_idle(&BundleId::new(bundle_id.clone())).await;
    let built = h
        .store
        .bundle(&BundleId::new(bundle_id.clone()))
        .await
        .unwrap()
        .unwrap();
    assert!(built.has_archive(), "bundle should be built after debounce");

    let res = h
        .server
        .post(&format!("/bundles/{bundle_id}/recipients"))
        .json(&json!({
            "recipient_id": recipient["id"],
            "max_downloads": max_downloads,
            "cooldown_seconds": cooldown_seconds,
        }))
        .await;
    assert_eq!(res.status_code(), 201);

    recipient_login(h, "reader@example.com").await;
    bundle_id
}

#[tokio::test]
async fn health_is_public() {
    let h = harness();
    let res = h.server.get("/health").await;
    res.assert_status_ok();
}

#[tokio::test]
async fn admin_routes_require_auth() {
    let h = harness();
    let res = h.server.get("/bundles").await;
    assert_eq!(res.status_code(), 401);
    let body: serde_json::Value = res.json();
    assert_eq!(body["status"], "error");
    assert_eq!(body["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn magic_link_is_single_use() {
    let h = harness();
    let res = h
        .server
        .post("/auth/admin/start")
        .json(&json!({"email": "admin@example.com"}))
        .await;
    let body: serde_json::Value = res.json();
    let url = body["login_url"].as_str().unwrap();
    let token = url.split("token=").nth(1).unwrap().to_owned();

    let res = h
        .server
        .get("/auth/admin/callback")
        .add_query_param("token", &token)
        .await;
    res.assert_status_ok();

    let res = h
        .server
        .get("/auth/admin/callback")
        .add_query_param("token", &token)
        .await;
    assert_eq!(res.status_code(), 410);
    let body: serde_json::Value = res.json();
    assert_eq!(body["code"], "EXPIRED");
}

#[tokio::test]
async fn session_secrets_are_stored_hashed_only() {
    let h = harness();
    let res = h
        .server
        .post("/auth/admin/start")
        .json(&json!({"email": "admin@example.com"}))
        .await;
    let body: serde_json::Value = res.json();
    let token = body["login_url"]
        .as_str()
        .unwrap()
        .split("token=")
        .nth(1)
        .unwrap()
        .to_owned();
    let res = h
        .server
        .get("/auth/admin/callback")
        .add_query_param("token", &token)
        .await;
    let raw_session = res.cookie("lf_admin_sess").value().to_owned();

    // The raw cookie value is not a lookup key; its hash is.
    assert!(
        h.store
            .session_by_token_hash(&raw_session)
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        h.store
            .session_by_token_hash(&sha256_hex(raw_session.as_bytes()))
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn admin_logout_clears_cookie_even_without_session() {
    let h = harness();
    let res = h.server.post("/auth/admin/logout").await;
    assert_eq!(res.status_code(), 204);
    let cookie = res.cookie("lf_admin_sess");
    assert_eq!(cookie.max_age(), Some(time::Duration::ZERO));
}

#[tokio::test]
async fn otp_start_does_not_leak_existence() {
    let h = harness();
    let res = h
        .server
        .post("/auth/recipient/start")
        .json(&json!({"email": "ghost@example.com"}))
        .await;
    assert_eq!(res.status_code(), 204);
    assert!(h.email.outbox().is_empty());
}

#[tokio::test]
async fn otp_verify_rejects_wrong_code() {
    let h = harness();
    admin_login(&h).await;
    let res = h
        .server
        .post("/recipients")
        .json(&json!({"email": "reader@example.com"}))
        .await;
    assert_eq!(res.status_code(), 201);

    h.server
        .post("/auth/recipient/start")
        .json(&json!({"email": "reader@example.com"}))
        .await;

    let res = h
        .server
        .post("/auth/recipient/verify")
        .json(&json!({"email": "reader@example.com", "otp": "000000"}))
        .await;
    assert_eq!(res.status_code(), 401);
}

#[tokio::test]
async fn download_quota_of_one_admits_exactly_one_of_two_concurrent() {
    let h = harness();
    let bundle_id = seed_downloadable_bundle(&h, Some(1), None).await;

    let path = format!("/portal/bundles/{bundle_id}");
    let (a, b) = tokio::join!(h.server.get(&path), h.server.get(&path));

    let statuses = [a.status_code(), b.status_code()];
    assert!(statuses.contains(&axum::http::StatusCode::OK));
    assert!(statuses.contains(&axum::http::StatusCode::FORBIDDEN));

    let denied = if a.status_code() == 403 { a } else { b };
    let body: serde_json::Value = denied.json();
    assert_eq!(body["code"], "MAX_DOWNLOADS_EXCEEDED");

    let ok = h.server.get(&path).await;
    assert_eq!(ok.status_code(), 403, "quota stays spent");
}

#[tokio::test]
async fn downloaded_archive_streams_with_etag() {
    let h = harness();
    let bundle_id = seed_downloadable_bundle(&h, None, None).await;

    let res = h.server.get(&format!("/portal/bundles/{bundle_id}")).await;
    res.assert_status_ok();
    assert_eq!(
        res.header("content-type").to_str().unwrap(),
        "application/octet-stream"
    );
    assert!(!res.header("etag").is_empty());
    let bytes = res.as_bytes();
    // ZIP local-file-header magic.
    assert_eq!(&bytes[..4], b"PK\x03\x04");
}

#[tokio::test]
async fn download_cooldown_blocks_then_releases() {
    let h = harness();
    let bundle_id = seed_downloadable_bundle(&h, None, Some(1)).await;
    let path = format!("/portal/bundles/{bundle_id}");

    let res = h.server.get(&path).await;
    res.assert_status_ok();

    let res = h.server.get(&path).await;
    assert_eq!(res.status_code(), 429);
    let body: serde_json::Value = res.json();
    assert_eq!(body["code"], "COOLDOWN_ACTIVE");

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let res = h.server.get(&path).await;
    res.assert_status_ok();
}

#[tokio::test]
async fn device_flow_issues_token_exactly_once() {
    let mut h = harness();
    admin_login(&h).await;

    let res = h
        .server
        .post("/auth/cli/device/start")
        .json(&json!({"email": "admin@example.com", "device_name": "laptop"}))
        .await;
    res.assert_status_ok();
    let start: serde_json::Value = res.json();
    let device_code = start["device_code"].as_str().unwrap().to_owned();
    let user_code = start["user_code"].as_str().unwrap().to_owned();
    assert_eq!(start["interval"], 0);

    // Pending before approval.
    let res = h
        .server
        .post("/auth/cli/device/poll")
        .json(&json!({"device_code": device_code}))
        .await;
    assert_eq!(res.status_code(), 202);

    let res = h
        .server
        .post("/auth/cli/device/approve")
        .json(&json!({"user_code": user_code}))
        .await;
    assert_eq!(res.status_code(), 204);

    // First poll after approval: the raw token, prefixed.
    let res = h
        .server
        .post("/auth/cli/device/poll")
        .json(&json!({"device_code": device_code}))
        .await;
    res.assert_status_ok();
    let body: serde_json::Value = res.json();
    let access_token = body["access_token"].as_str().unwrap().to_owned();
    assert!(access_token.starts_with("lfk_"));

    // Second poll: gone.
    let res = h
        .server
        .post("/auth/cli/device/poll")
        .json(&json!({"device_code": device_code}))
        .await;
    assert_eq!(res.status_code(), 410);
    let body: serde_json::Value = res.json();
    assert_eq!(body["code"], "UNAVAILABLE");

    // The raw token is stored hash-only.
    assert!(
        h.store
            .api_token_by_hash(&access_token)
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        h.store
            .api_token_by_hash(&sha256_hex(access_token.as_bytes()))
            .await
            .unwrap()
            .is_some()
    );

    // The bearer works on scoped routes within its default scopes.
    h.server.clear_cookies();
    let res = h
        .server
        .get("/auth/cli/tokens")
        .add_header("authorization", format!("Bearer {access_token}"))
        .await;
    res.assert_status_ok();
}

#[tokio::test]
async fn device_poll_enforces_interval() {
    let h = harness_with(LatchflowConfig {
        allow_dev_auth: true,
        device_code_interval: Duration::from_secs(5),
        ..LatchflowConfig::default()
    });

    let res = h
        .server
        .post("/auth/cli/device/start")
        .json(&json!({"email": "admin@example.com"}))
        .await;
    let start: serde_json::Value = res.json();
    let device_code = start["device_code"].as_str().unwrap().to_owned();

    let res = h
        .server
        .post("/auth/cli/device/poll")
        .json(&json!({"device_code": device_code}))
        .await;
    assert_eq!(res.status_code(), 202);

    let res = h
        .server
        .post("/auth/cli/device/poll")
        .json(&json!({"device_code": device_code}))
        .await;
    assert_eq!(res.status_code(), 429);
    let body: serde_json::Value = res.json();
    assert_eq!(body["code"], "SLOW_DOWN");
}

#[tokio::test]
async fn bearer_token_scopes_are_enforced() {
    let h = harness();
    seed_downloadable_bundle(&h, None, None).await;

    // Mint a CLI token (default scope core:read only).
    let res = h
        .server
        .post("/auth/cli/device/start")
        .json(&json!({"email": "admin@example.com"}))
        .await;
    let start: serde_json::Value = res.json();
    let device_code = start["device_code"].as_str().unwrap().to_owned();
    let user_code = start["user_code"].as_str().unwrap().to_owned();
    h.server
        .post("/auth/cli/device/approve")
        .json(&json!({"user_code": user_code}))
        .await;
    let res = h
        .server
        .post("/auth/cli/device/poll")
        .json(&json!({"device_code": device_code}))
        .await;
    let token: String = res.json::<serde_json::Value>()["access_token"]
        .as_str()
        .unwrap()
        .to_owned();

    // The cookie jar still holds a valid admin session, but a bearer
    // header is authoritative: bundles:read is not among the default
    // scopes, so this is 403 -- never a cookie fallback.
    let res = h
        .server
        .get("/bundles")
        .add_header("authorization", format!("Bearer {token}"))
        .await;
    assert_eq!(res.status_code(), 403);

    // Same for an unknown bearer: 401, not the cookie's 200.
    let res = h
        .server
        .get("/bundles")
        .add_header("authorization", "Bearer bogus")
        .await;
    assert_eq!(res.status_code(), 401);

    // Without the header, the same cookie jar authorizes normally.
    let res = h.server.get("/bundles").await;
    res.assert_status_ok();
}

#[tokio::test]
async fn lazy_rebuild_follows_object_toggle_on_download() {
    let h = harness();
    let bundle_id = seed_downloadable_bundle(&h, None, None).await;
    let id = BundleId::new(bundle_id.clone());
    let before = h.store.bundle(&id).await.unwrap().unwrap();

    // Disable one object directly in the store, leaving the stored digest
    // stale (no scheduler involvement).
    let object = h
        .store
        .bundle_objects(&id)
        .await
        .unwrap()
        .into_iter()
        .next()
        .unwrap();
    {
        use latchflow_core::{ActorRef, UserId};
        let mut o = object;
        o.is_enabled = false;
        // Raw store mutation bypasses the HTTP layer's schedule() call.
        h.store
            .update_bundle_object(o, &ActorRef::user(UserId::new("test")))
            .await
            .unwrap();
    }

    // One authorized download triggers the post-dispatch digest check.
    let res = h.server.get(&format!("/portal/bundles/{bundle_id}")).await;
    res.assert_status_ok();

    // The self-heal rebuild lands after the debounce window.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let current = h.store.bundle(&id).await.unwrap().unwrap();
        if current.bundle_digest != before.bundle_digest {
            assert_ne!(current.storage_path, before.storage_path);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "rebuild did not happen"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn bundle_versions_materialize_history() {
    let h = harness();
    let bundle_id = seed_downloadable_bundle(&h, None, None).await;

    let res = h
        .server
        .get(&format!("/bundles/{bundle_id}/versions"))
        .await;
    res.assert_status_ok();
    let body: serde_json::Value = res.json();
    let versions = body["versions"].as_array().unwrap();
    assert!(versions.len() >= 3, "create + objects + build commit");

    let res = h
        .server
        .get(&format!("/bundles/{bundle_id}/versions/1"))
        .await;
    res.assert_status_ok();
    let body: serde_json::Value = res.json();
    assert_eq!(body["version"], 1);
    assert_eq!(body["state"]["bundle"]["name"], "quarterly-report");
    assert_eq!(body["state"]["objects"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn portal_requires_recipient_session() {
    let h = harness();
    let res = h.server.get("/portal/me").await;
    assert_eq!(res.status_code(), 401);
}

#[tokio::test]
async fn portal_lists_granted_bundles() {
    let h = harness();
    let bundle_id = seed_downloadable_bundle(&h, Some(3), None).await;

    let res = h.server.get("/portal/bundles").await;
    res.assert_status_ok();
    let body: serde_json::Value = res.json();
    let bundles = body["bundles"].as_array().unwrap();
    assert_eq!(bundles.len(), 1);
    assert_eq!(bundles[0]["bundle"]["id"], bundle_id.as_str());
    assert_eq!(bundles[0]["assignment"]["max_downloads"], 3);
    assert_eq!(bundles[0]["assignment"]["downloads_used"], 0);
}

#[tokio::test]
async fn in_use_delete_is_409() {
    let h = harness();
    let bundle_id = seed_downloadable_bundle(&h, None, None).await;

    let res = h.server.delete(&format!("/bundles/{bundle_id}")).await;
    assert_eq!(res.status_code(), 409);
    let body: serde_json::Value = res.json();
    assert_eq!(body["code"], "IN_USE");
}

#[tokio::test]
async fn upload_url_is_501_on_memory_driver() {
    let h = harness();
    admin_login(&h).await;
    let res = h
        .server
        .post("/files/upload-url")
        .json(&json!({"key": "big.bin"}))
        .await;
    assert_eq!(res.status_code(), 501);
    let body: serde_json::Value = res.json();
    assert_eq!(body["code"], "NOT_IMPLEMENTED");
}
