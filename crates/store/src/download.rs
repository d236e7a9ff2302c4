use async_trait::async_trait;
use chrono::{DateTime, Utc};

use latchflow_core::{BundleAssignment, DownloadEvent};

use crate::error::StoreError;

/// Input for recording a download admission.
#[derive(Debug, Clone)]
pub struct NewDownloadEvent {
    pub downloaded_at: DateTime<Utc>,
    pub ip: String,
    pub user_agent: String,
}

/// An open download-admission transaction.
///
/// Obtained from [`RecipientStore::begin_download`](crate::RecipientStore::begin_download),
/// which locks the assignment row the way a SQL backend would with
/// `SELECT ... FOR UPDATE`: no other admission for the same assignment can
/// proceed until this one commits or is dropped. Dropping without
/// [`commit`](Self::commit) releases the lock with no writes.
#[async_trait]
pub trait DownloadTx: Send {
    /// The assignment row as loaded under the lock.
    fn assignment(&self) -> &BundleAssignment;

    /// Number of download events already recorded for the assignment.
    async fn download_count(&self) -> Result<u64, StoreError>;

    /// Insert the download event and stamp `last_download_at`, atomically
    /// with releasing the lock.
    async fn commit(self: Box<Self>, event: NewDownloadEvent) -> Result<DownloadEvent, StoreError>;
}
