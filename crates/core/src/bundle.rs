use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{BundleId, FileId};

/// A named, ordered logical archive of files.
///
/// Invariants: when `bundle_digest` is non-empty, `storage_path` points at a
/// storage object whose bytes hash to `checksum`. While either is pending the
/// bundle is not downloadable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    pub id: BundleId,
    pub name: String,
    pub description: Option<String>,
    /// Storage key of the current archive, empty until the first build commits.
    pub storage_path: String,
    /// Hash (or storage etag) of the archive bytes at `storage_path`.
    pub checksum: String,
    /// Deterministic digest over the bundle's enabled objects; decides
    /// whether a rebuild is required.
    pub bundle_digest: String,
    pub is_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bundle {
    /// Whether the bundle currently points at a built archive.
    #[must_use]
    pub fn has_archive(&self) -> bool {
        !self.storage_path.is_empty() && !self.bundle_digest.is_empty()
    }
}

/// The ordered inclusion of a file within a bundle.
///
/// The logical contents of a bundle are its enabled objects ordered by
/// `sort_order`, tie-broken by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleObject {
    pub id: String,
    pub bundle_id: BundleId,
    pub file_id: FileId,
    pub sort_order: i32,
    /// Required objects block a build when their file is missing.
    pub required: bool,
    pub is_enabled: bool,
}
