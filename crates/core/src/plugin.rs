use serde::{Deserialize, Serialize};

use crate::types::{CapabilityId, PluginId};

/// Whether a capability produces triggers or executes actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapabilityKind {
    Trigger,
    Action,
}

/// An installed plugin. A plugin declares zero or more capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plugin {
    pub id: PluginId,
    /// Unique plugin name (e.g. `"cron"`, `"email"`).
    pub name: String,
    pub version: Option<String>,
}

/// A single capability declared by a plugin.
///
/// `(plugin_id, kind, key)` is unique. Disabled capabilities must never be
/// instantiated into runtimes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginCapability {
    pub id: CapabilityId,
    pub plugin_id: PluginId,
    pub kind: CapabilityKind,
    /// Capability key, unique within the plugin for its kind.
    pub key: String,
    pub display_name: String,
    /// JSON schema describing the capability's config, if the plugin ships one.
    pub config_schema: Option<serde_json::Value>,
    pub is_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_kind_serde_is_screaming_snake() {
        let json = serde_json::to_string(&CapabilityKind::Trigger).unwrap();
        assert_eq!(json, "\"TRIGGER\"");
        let back: CapabilityKind = serde_json::from_str("\"ACTION\"").unwrap();
        assert_eq!(back, CapabilityKind::Action);
    }
}
