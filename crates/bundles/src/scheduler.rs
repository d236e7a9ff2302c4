use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument};

use latchflow_core::{BundleId, FileId};
use latchflow_storage::StorageService;
use latchflow_store::{BundlePointer, LatchflowStore};

use crate::archive::build_zip_archive;
use crate::digest::compute_bundle_digest;
use crate::error::SchedulerError;

/// Tunables for the rebuild scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Window within which repeated requests for one bundle coalesce.
    pub debounce: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
        }
    }
}

/// Scheduler-visible lifecycle of a bundle's build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Idle,
    Queued,
    Running,
    Failed,
}

/// Summary of the most recent completed build.
#[derive(Debug, Clone, Serialize)]
pub struct LastBuild {
    pub digest: String,
    pub completed_at: DateTime<Utc>,
    pub bytes: u64,
}

/// Snapshot returned by [`BundleScheduler::get_status`].
#[derive(Debug, Clone, Serialize)]
pub struct BuildStatus {
    pub state: BuildState,
    pub last: Option<LastBuild>,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct BundleState {
    debounce: Option<JoinHandle<()>>,
    running: bool,
    pending: bool,
    force_pending: bool,
    state: Option<BuildState>,
    last: Option<LastBuild>,
    last_error: Option<String>,
}

struct SchedInner {
    store: Arc<dyn LatchflowStore>,
    storage: StorageService,
    config: SchedulerConfig,
    states: DashMap<BundleId, Mutex<BundleState>>,
    tracker: TaskTracker,
}

/// Debounced, coalesced, single-flight bundle rebuild scheduler.
///
/// Requests within the debounce window collapse into one build; requests
/// arriving while a build runs set a pending flag that triggers exactly one
/// follow-up build. There is no backoff at this layer -- request frequency
/// upstream is the throttle.
#[derive(Clone)]
pub struct BundleScheduler {
    inner: Arc<SchedInner>,
}

impl BundleScheduler {
    pub fn new(
        store: Arc<dyn LatchflowStore>,
        storage: StorageService,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedInner {
                store,
                storage,
                config,
                states: DashMap::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Request a (re)build of `bundle_id`. `force` rebuilds even when the
    /// digest is unchanged.
    pub fn schedule(&self, bundle_id: &BundleId, force: bool) {
        let entry = self
            .inner
            .states
            .entry(bundle_id.clone())
            .or_default();
        let mut state = entry.lock();

        if state.running {
            state.pending = true;
            state.force_pending |= force;
            return;
        }

        // Reset the debounce window: the newest request wins.
        if let Some(handle) = state.debounce.take() {
            handle.abort();
        }
        state.state = Some(BuildState::Queued);

        let scheduler = self.clone();
        let id = bundle_id.clone();
        let debounce = self.inner.config.debounce;
        let handle = self.inner.tracker.spawn(async move {
            tokio::time::sleep(debounce).await;
            scheduler.run_build(id, force).await;
        });
        state.debounce = Some(handle);
    }

    /// Request rebuilds for every bundle containing any of `files`.
    pub async fn schedule_for_files(&self, files: &[FileId]) -> Result<(), SchedulerError> {
        let bundles = self.inner.store.bundles_containing_files(files).await?;
        for bundle in bundles {
            self.schedule(&bundle, false);
        }
        Ok(())
    }

    /// Current build status for a bundle.
    #[must_use]
    pub fn get_status(&self, bundle_id: &BundleId) -> BuildStatus {
        self.inner
            .states
            .get(bundle_id)
            .map(|entry| {
                let state = entry.lock();
                BuildStatus {
                    state: state.state.unwrap_or(BuildState::Idle),
                    last: state.last.clone(),
                    last_error: state.last_error.clone(),
                }
            })
            .unwrap_or(BuildStatus {
                state: BuildState::Idle,
                last: None,
                last_error: None,
            })
    }

    /// Cancel pending debounce timers and wait for in-flight builds.
    pub async fn stop(&self) {
        for entry in self.inner.states.iter() {
            let mut state = entry.lock();
            if let Some(handle) = state.debounce.take() {
                handle.abort();
            }
        }
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("bundle scheduler stopped");
    }

    /// Wait until no build or debounce timer is active for `bundle_id`.
    /// Test support; production callers poll [`get_status`](Self::get_status).
    pub async fn wait_idle(&self, bundle_id: &BundleId) {
        loop {
            let busy = self.inner.states.get(bundle_id).is_some_and(|entry| {
                let state = entry.lock();
                state.running || state.debounce.is_some() || state.pending
            });
            if !busy {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    async fn run_build(&self, bundle_id: BundleId, force: bool) {
        // Transition queued → running; a concurrent build flips us to pending.
        {
            let entry = self.inner.states.entry(bundle_id.clone()).or_default();
            let mut state = entry.lock();
            if state.running {
                state.pending = true;
                state.force_pending |= force;
                return;
            }
            state.running = true;
            state.debounce = None;
            state.state = Some(BuildState::Running);
        }

        let result = self.build(&bundle_id, force).await;

        let followup = {
            let entry = self.inner.states.entry(bundle_id.clone()).or_default();
            let mut state = entry.lock();
            state.running = false;
            match result {
                Ok(last) => {
                    state.state = Some(BuildState::Idle);
                    state.last_error = None;
                    if let Some(last) = last {
                        state.last = Some(last);
                    }
                }
                Err(e) => {
                    error!(bundle = %bundle_id, error = %e, "bundle build failed");
                    state.state = Some(BuildState::Failed);
                    state.last_error = Some(e.to_string());
                }
            }
            let pending = std::mem::take(&mut state.pending);
            let force_pending = std::mem::take(&mut state.force_pending);
            pending.then_some(force_pending)
        };

        if let Some(force_next) = followup {
            self.schedule(&bundle_id, force_next);
        }
    }

    /// One build pass. `Ok(None)` means the digest matched and nothing was
    /// written.
    #[instrument(skip(self), fields(bundle = %bundle_id))]
    async fn build(
        &self,
        bundle_id: &BundleId,
        force: bool,
    ) -> Result<Option<LastBuild>, SchedulerError> {
        let bundle = self
            .inner
            .store
            .bundle(bundle_id)
            .await?
            .ok_or_else(|| SchedulerError::BundleNotFound(bundle_id.clone()))?;

        let objects = self
            .inner
            .store
            .enabled_bundle_objects_with_files(bundle_id)
            .await?;
        let digest = compute_bundle_digest(bundle_id, &objects);

        if !force && !bundle.bundle_digest.is_empty() && digest == bundle.bundle_digest {
            debug!(digest = %digest, "digest unchanged, skipping build");
            return Ok(None);
        }

        let mut entries = Vec::with_capacity(objects.len());
        for (object, file) in &objects {
            match self.inner.storage.get_file_bytes(&file.storage_key).await {
                Ok(bytes) => entries.push((file.key.clone(), bytes)),
                Err(latchflow_storage::StorageError::NotFound(_)) if !object.required => {
                    debug!(file = %file.id, "optional file missing, omitted from archive");
                }
                Err(latchflow_storage::StorageError::NotFound(_)) => {
                    return Err(SchedulerError::RequiredFileMissing {
                        bundle: bundle_id.clone(),
                        file: file.id.to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        let archive = build_zip_archive(entries).await?;
        let put = self.inner.storage.put_file(archive, "application/zip").await?;

        let completed_at = Utc::now();
        self.inner
            .store
            .commit_bundle_pointer(
                bundle_id,
                BundlePointer {
                    storage_path: put.storage_key.clone(),
                    checksum: put.storage_etag.clone().unwrap_or_else(|| put.sha256.clone()),
                    bundle_digest: digest.clone(),
                    updated_at: completed_at,
                },
            )
            .await?;

        info!(digest = %digest, bytes = put.size, "bundle archive committed");
        Ok(Some(LastBuild {
            digest,
            completed_at,
            bytes: put.size,
        }))
    }
}
