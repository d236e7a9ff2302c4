//! Change-log append and materialization mechanics.
//!
//! Every mutation of a versioned entity appends one row: a **snapshot**
//! (full state) on the first version and every `snapshot_interval` versions
//! after it, a **delta** (JSON patch against the previous version)
//! otherwise. Materializing version *v* composes the nearest snapshot ≤ *v*
//! with the deltas up to *v*; `max_chain_depth` bounds that walk.

use latchflow_core::{ActorRef, ChangeKind};

/// Tunables for the change-log appender.
#[derive(Debug, Clone, Copy)]
pub struct HistoryConfig {
    /// A snapshot row is written every this many versions (default 20).
    pub snapshot_interval: u32,
    /// Upper bound on snapshot-to-version delta walks (default 200).
    pub max_chain_depth: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: 20,
            max_chain_depth: 200,
        }
    }
}

impl HistoryConfig {
    /// Whether the row at `version` (1-based) must be a snapshot.
    #[must_use]
    pub fn is_snapshot_version(&self, version: u64) -> bool {
        version == 1 || (version - 1) % u64::from(self.snapshot_interval.max(1)) == 0
    }
}

/// One change to append to an entity's history.
///
/// `state` is the complete entity state after the mutation; the appender
/// decides whether to store it whole (snapshot) or as a patch (delta).
#[derive(Debug, Clone)]
pub struct AppendChange {
    pub entity_type: &'static str,
    pub entity_id: String,
    pub state: serde_json::Value,
    pub change_note: Option<String>,
    pub changed_path: Option<String>,
    pub change_kind: ChangeKind,
    pub actor: ActorRef,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_cadence_with_default_interval() {
        let cfg = HistoryConfig::default();
        assert!(cfg.is_snapshot_version(1));
        assert!(!cfg.is_snapshot_version(2));
        assert!(!cfg.is_snapshot_version(20));
        assert!(cfg.is_snapshot_version(21));
        assert!(cfg.is_snapshot_version(41));
    }

    #[test]
    fn snapshot_cadence_with_interval_one_is_all_snapshots() {
        let cfg = HistoryConfig {
            snapshot_interval: 1,
            max_chain_depth: 10,
        };
        for v in 1..=5 {
            assert!(cfg.is_snapshot_version(v));
        }
    }
}
