use thiserror::Error;

use latchflow_core::CapabilityId;

/// Errors from the registry and runtime instantiation.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The capability is not registered. Usually a hot-reload race or a
    /// stale definition row pointing at an uninstalled plugin.
    #[error("CAPABILITY_NOT_FOUND: capability {0} is not registered")]
    CapabilityNotFound(CapabilityId),

    /// The capability exists but is disabled and must not be instantiated.
    #[error("capability {0} is disabled")]
    CapabilityDisabled(CapabilityId),

    /// The factory returned a runtime of the wrong variant for the
    /// capability kind (e.g. an action runtime for a trigger capability).
    #[error("INVALID_RUNTIME: capability {capability} produced a {got} runtime, expected {expected}")]
    InvalidRuntime {
        capability: CapabilityId,
        expected: &'static str,
        got: &'static str,
    },

    /// A capability with the same `(plugin, kind, key)` is already registered.
    #[error("capability {0} already registered")]
    Duplicate(CapabilityId),

    /// The factory itself failed to construct the runtime.
    #[error("factory for capability {capability} failed: {message}")]
    Factory {
        capability: CapabilityId,
        message: String,
    },
}
