use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::FileId;

/// A content-addressed blob tracked by Latchflow.
///
/// `key` is the logical path admins address the file by (unique);
/// `storage_key` is where the bytes actually live, derived from
/// `content_hash`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    /// Logical key, unique across all files (e.g. `"reports/q3.pdf"`).
    pub key: String,
    pub storage_key: String,
    pub size: u64,
    pub content_type: String,
    /// Lowercase hex SHA-256 of the file bytes, 64 chars.
    pub content_hash: String,
    pub etag: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
