use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AssignmentId, BundleId, RecipientId};

/// A named recipient of bundle assignments. Email is stored lowercase and is
/// unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub id: RecipientId,
    pub email: String,
    pub name: Option<String>,
    pub is_enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// A per-recipient grant attaching limits to a bundle.
///
/// Unique on `(bundle_id, recipient_id)`. `max_downloads` and
/// `cooldown_seconds` are both optional; `None` means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleAssignment {
    pub id: AssignmentId,
    pub bundle_id: BundleId,
    pub recipient_id: RecipientId,
    pub is_enabled: bool,
    pub max_downloads: Option<u32>,
    pub cooldown_seconds: Option<u32>,
    pub last_download_at: Option<DateTime<Utc>>,
    /// Whether the recipient has completed any extra verification the
    /// assignment demands. Unverified assignments are hidden from the portal.
    pub verification_met: bool,
    pub created_at: DateTime<Utc>,
}

/// Append-only record of one successful download admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadEvent {
    pub id: String,
    pub bundle_assignment_id: AssignmentId,
    pub downloaded_at: DateTime<Utc>,
    pub ip: String,
    pub user_agent: String,
}
