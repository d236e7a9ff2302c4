use thiserror::Error;

/// Errors from storage drivers and the content-addressed service.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested object was not found.
    #[error("object not found: {0}")]
    NotFound(String),

    /// A backend error occurred.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// The requested byte range is not satisfiable.
    #[error("invalid range for object {key}: {detail}")]
    InvalidRange { key: String, detail: String },

    /// The driver does not implement an optional capability.
    #[error("storage driver does not support {0}")]
    NotSupported(&'static str),

    /// The object stream failed mid-read.
    #[error("stream error: {0}")]
    Stream(String),
}
