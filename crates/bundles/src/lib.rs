//! Bundle building and download enforcement.
//!
//! The [`BundleScheduler`] debounces and coalesces rebuild requests,
//! running at most one build per bundle at a time. A build digests the
//! bundle's enabled objects, skips work when nothing changed, and otherwise
//! writes a fresh zip archive to content-addressed storage before
//! atomically committing the bundle's storage pointer.
//!
//! The [`DownloadGuard`] is the recipient-facing admission path: it
//! enforces per-assignment quotas and cooldowns transactionally, records
//! the download event, and lazily self-heals stale archives by scheduling
//! a rebuild when the stored digest has drifted.

mod archive;
mod digest;
mod download;
mod error;
mod scheduler;

pub use archive::build_zip_archive;
pub use digest::compute_bundle_digest;
pub use download::{AdmittedDownload, DownloadGuard};
pub use error::{DownloadError, SchedulerError};
pub use scheduler::{BuildState, BuildStatus, BundleScheduler, LastBuild, SchedulerConfig};
