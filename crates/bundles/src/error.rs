use thiserror::Error;

use latchflow_core::BundleId;

/// Errors from bundle builds.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("bundle not found: {0}")]
    BundleNotFound(BundleId),

    /// A required object's file is missing from metadata or storage.
    #[error("required file {file} missing for bundle {bundle}")]
    RequiredFileMissing { bundle: BundleId, file: String },

    #[error("archive build failed: {0}")]
    Archive(String),

    #[error(transparent)]
    Storage(#[from] latchflow_storage::StorageError),

    #[error(transparent)]
    Store(#[from] latchflow_store::StoreError),
}

/// Outcomes of the download admission path, each pinned to an HTTP status
/// and code by the server layer.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Missing or disabled assignment. Deliberately indistinguishable to
    /// the caller.
    #[error("assignment does not grant access")]
    Forbidden,

    /// The per-assignment download quota is spent.
    #[error("max downloads exceeded ({used}/{max})")]
    QuotaExceeded { used: u64, max: u32 },

    /// The assignment's cooldown window is still open.
    #[error("cooldown active, retry in {retry_after_secs}s")]
    CooldownActive { retry_after_secs: u64 },

    /// The bundle is disabled or gone.
    #[error("bundle unavailable")]
    BundleUnavailable,

    /// The bundle has no built archive yet.
    #[error("bundle has no storage path")]
    NoStoragePath,

    #[error(transparent)]
    Store(#[from] latchflow_store::StoreError),

    #[error(transparent)]
    Storage(#[from] latchflow_storage::StorageError),
}
