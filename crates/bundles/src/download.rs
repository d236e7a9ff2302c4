use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use latchflow_core::{AssignmentId, Bundle, BundleId, DownloadEvent};
use latchflow_store::{LatchflowStore, NewDownloadEvent};

use crate::digest::compute_bundle_digest;
use crate::error::DownloadError;
use crate::scheduler::BundleScheduler;

/// A committed download admission: the event is recorded and the bundle is
/// ready to stream.
#[derive(Debug, Clone)]
pub struct AdmittedDownload {
    pub bundle: Bundle,
    pub event: DownloadEvent,
}

/// Transactional quota/cooldown enforcement for recipient downloads.
pub struct DownloadGuard {
    store: Arc<dyn LatchflowStore>,
    scheduler: BundleScheduler,
}

impl DownloadGuard {
    pub fn new(store: Arc<dyn LatchflowStore>, scheduler: BundleScheduler) -> Self {
        Self { store, scheduler }
    }

    /// Run the guarded admission for one download request.
    ///
    /// Quota and cooldown are checked and the event inserted under the
    /// assignment lock, so two racing requests can never both pass a
    /// `max_downloads` boundary. Bundle resolution happens after the commit:
    /// the event stands even if the archive turns out unavailable.
    #[instrument(skip(self), fields(assignment = %assignment_id))]
    pub async fn authorize(
        &self,
        assignment_id: &AssignmentId,
        now: DateTime<Utc>,
        ip: &str,
        user_agent: &str,
    ) -> Result<AdmittedDownload, DownloadError> {
        let tx = match self.store.begin_download(assignment_id).await {
            Ok(tx) => tx,
            Err(latchflow_store::StoreError::NotFound { .. }) => {
                return Err(DownloadError::Forbidden);
            }
            Err(e) => return Err(e.into()),
        };

        let assignment = tx.assignment().clone();
        if !assignment.is_enabled {
            return Err(DownloadError::Forbidden);
        }

        if let Some(max) = assignment.max_downloads {
            let used = tx.download_count().await?;
            if used >= u64::from(max) {
                return Err(DownloadError::QuotaExceeded { used, max });
            }
        }

        if let (Some(cooldown), Some(last)) =
            (assignment.cooldown_seconds, assignment.last_download_at)
        {
            let until = last + chrono::Duration::seconds(i64::from(cooldown));
            if until > now {
                let retry_after_secs = (until - now).num_seconds().max(1) as u64;
                return Err(DownloadError::CooldownActive { retry_after_secs });
            }
        }

        let event = tx
            .commit(NewDownloadEvent {
                downloaded_at: now,
                ip: ip.to_owned(),
                user_agent: user_agent.to_owned(),
            })
            .await?;

        // Post-commit: resolve the archive pointer.
        let bundle = self
            .store
            .bundle(&assignment.bundle_id)
            .await?
            .filter(|b| b.is_enabled)
            .ok_or(DownloadError::BundleUnavailable)?;
        if bundle.storage_path.is_empty() || bundle.bundle_digest.is_empty() {
            return Err(DownloadError::NoStoragePath);
        }

        Ok(AdmittedDownload { bundle, event })
    }

    /// Recompute the bundle digest and schedule a rebuild when the stored
    /// pointer has drifted. Runs after dispatch; failures are logged only.
    pub async fn verify_digest(&self, bundle_id: &BundleId) {
        let objects = match self.store.enabled_bundle_objects_with_files(bundle_id).await {
            Ok(objects) => objects,
            Err(e) => {
                warn!(bundle = %bundle_id, error = %e, "digest verify read failed");
                return;
            }
        };
        let current = compute_bundle_digest(bundle_id, &objects);

        match self.store.bundle(bundle_id).await {
            Ok(Some(bundle)) if bundle.bundle_digest != current => {
                debug!(bundle = %bundle_id, "stored digest drifted, scheduling rebuild");
                self.scheduler.schedule(bundle_id, false);
            }
            Ok(_) => {}
            Err(e) => warn!(bundle = %bundle_id, error = %e, "digest verify read failed"),
        }
    }
}
