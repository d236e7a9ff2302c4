use thiserror::Error;

use latchflow_core::TriggerDefId;

/// Errors from trigger management and firing.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("trigger definition not found: {0}")]
    DefinitionNotFound(TriggerDefId),

    #[error(transparent)]
    Plugin(#[from] latchflow_plugin::PluginError),

    #[error("config decryption failed: {0}")]
    Crypto(#[from] latchflow_crypto::CryptoError),

    #[error(transparent)]
    Store(#[from] latchflow_store::StoreError),

    #[error("trigger runtime failed: {0}")]
    Runtime(#[from] latchflow_plugin::PluginServiceError),
}
