//! Route-permission policy and the authorization decision log.
//!
//! Policy signatures are `"METHOD /path"` strings with `:param` wildcard
//! segments. Admins are always authorized; non-admin sessions require a
//! matching rule.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use latchflow_core::UserId;

/// One compiled route permission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permission {
    pub method: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param,
}

impl Permission {
    /// Parse a `"METHOD /path"` signature.
    #[must_use]
    pub fn parse(signature: &str) -> Option<Self> {
        let (method, path) = signature.split_once(' ')?;
        let segments = path
            .trim_start_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| {
                if s.starts_with(':') {
                    Segment::Param
                } else {
                    Segment::Literal(s.to_owned())
                }
            })
            .collect();
        Some(Self {
            method: method.to_uppercase(),
            segments,
        })
    }

    /// Whether this permission covers `method` + `path`.
    #[must_use]
    pub fn matches(&self, method: &str, path: &str) -> bool {
        if !self.method.eq_ignore_ascii_case(method) {
            return false;
        }
        let parts: Vec<&str> = path
            .trim_start_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        if parts.len() != self.segments.len() {
            return false;
        }
        self.segments.iter().zip(parts).all(|(seg, part)| match seg {
            Segment::Literal(lit) => lit == part,
            Segment::Param => true,
        })
    }
}

/// A raw policy rule as configured.
#[derive(Debug, Clone)]
pub struct PolicyEntry {
    pub signature: String,
}

/// Compiled rule set.
#[derive(Debug, Default, Clone)]
pub struct Compiled {
    rules: Vec<Permission>,
}

impl Compiled {
    /// Compile entries, skipping malformed signatures.
    #[must_use]
    pub fn compile(entries: &[PolicyEntry]) -> Self {
        Self {
            rules: entries
                .iter()
                .filter_map(|e| Permission::parse(&e.signature))
                .collect(),
        }
    }

    /// Authorization verdict for a session-authenticated user.
    #[must_use]
    pub fn allows(&self, is_admin: bool, signature: &str) -> bool {
        if is_admin {
            return true;
        }
        let Some((method, path)) = signature.split_once(' ') else {
            return false;
        };
        self.rules.iter().any(|rule| rule.matches(method, path))
    }
}

/// One authorization decision.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub decision: &'static str,
    pub reason: String,
    pub signature: String,
    pub user_id: Option<UserId>,
    pub at: DateTime<Utc>,
}

/// Bounded in-process record of authorization decisions, alongside the
/// `authz` tracing target.
#[derive(Debug)]
pub struct DecisionLog {
    entries: Mutex<VecDeque<Decision>>,
    capacity: usize,
}

impl Default for DecisionLog {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl DecisionLog {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn log(
        &self,
        decision: &'static str,
        reason: impl Into<String>,
        signature: impl Into<String>,
        user_id: Option<UserId>,
    ) {
        let entry = Decision {
            decision,
            reason: reason.into(),
            signature: signature.into(),
            user_id,
            at: Utc::now(),
        };
        info!(
            target: "authz",
            decision = entry.decision,
            reason = %entry.reason,
            signature = %entry.signature,
            user = entry.user_id.as_ref().map(ToString::to_string),
            "authorization decision"
        );
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Recent decisions, oldest first.
    #[must_use]
    pub fn recent(&self) -> Vec<Decision> {
        self.entries.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_matches_params() {
        let perm = Permission::parse("GET /bundles/:bundleId").unwrap();
        assert!(perm.matches("GET", "/bundles/b-123"));
        assert!(perm.matches("get", "/bundles/b-123"));
        assert!(!perm.matches("POST", "/bundles/b-123"));
        assert!(!perm.matches("GET", "/bundles"));
        assert!(!perm.matches("GET", "/bundles/b-123/objects"));
    }

    #[test]
    fn admins_bypass_rules() {
        let compiled = Compiled::compile(&[]);
        assert!(compiled.allows(true, "DELETE /anything/at/all"));
        assert!(!compiled.allows(false, "DELETE /anything/at/all"));
    }

    #[test]
    fn non_admin_needs_matching_rule() {
        let compiled = Compiled::compile(&[PolicyEntry {
            signature: "GET /bundles/:bundleId".into(),
        }]);
        assert!(compiled.allows(false, "GET /bundles/b-1"));
        assert!(!compiled.allows(false, "DELETE /bundles/b-1"));
    }

    #[test]
    fn decision_log_is_bounded() {
        let log = DecisionLog::new(2);
        for i in 0..5 {
            log.log("ALLOW", format!("r{i}"), "GET /x", None);
        }
        let recent = log.recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].reason, "r3");
        assert_eq!(recent[1].reason, "r4");
    }
}
