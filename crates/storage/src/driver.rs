use std::collections::HashMap;
use std::ops::Range;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::StorageError;

/// A PUT request handed to a driver. The service has already derived the key.
#[derive(Debug, Clone)]
pub struct PutRequest {
    pub bucket: String,
    pub key: String,
    pub body: Bytes,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// What a driver reports back from a PUT.
#[derive(Debug, Clone, Default)]
pub struct DriverPut {
    pub etag: Option<String>,
    pub size: Option<u64>,
}

/// Object metadata from a HEAD.
#[derive(Debug, Clone)]
pub struct DriverHead {
    pub size: u64,
    pub etag: Option<String>,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
    /// Hex SHA-256 of the body when the backend tracks it natively.
    pub checksum_sha256_hex: Option<String>,
}

/// Options for a streaming GET.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Byte range to read, end-exclusive.
    pub range: Option<Range<u64>>,
}

/// A presigned upload target.
#[derive(Debug, Clone)]
pub struct SignedPutUrl {
    pub url: String,
    pub headers: HashMap<String, String>,
}

/// Pluggable object-store backend.
///
/// Implementations must be `Send + Sync`. The presign methods are optional
/// capabilities; drivers that lack them return
/// [`StorageError::NotSupported`], which the HTTP surface maps to
/// `501 NOT_IMPLEMENTED`.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Store an object.
    async fn put(&self, req: PutRequest) -> Result<DriverPut, StorageError>;

    /// Stream an object's bytes, optionally a sub-range.
    async fn get_stream(
        &self,
        bucket: &str,
        key: &str,
        opts: GetOptions,
    ) -> Result<BoxStream<'static, Result<Bytes, StorageError>>, StorageError>;

    /// Fetch object metadata without the body.
    async fn head(&self, bucket: &str, key: &str) -> Result<DriverHead, StorageError>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError>;

    /// Server-side copy, where the backend supports it.
    async fn copy_object(
        &self,
        bucket: &str,
        from_key: &str,
        to_key: &str,
    ) -> Result<(), StorageError> {
        let _ = (bucket, from_key, to_key);
        Err(StorageError::NotSupported("copy_object"))
    }

    /// Whether [`create_signed_put_url`](Self::create_signed_put_url) works.
    fn supports_signed_put(&self) -> bool {
        false
    }

    /// Presign a direct upload.
    async fn create_signed_put_url(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
        expires_in: Duration,
    ) -> Result<SignedPutUrl, StorageError> {
        let _ = (bucket, key, content_type, expires_in);
        Err(StorageError::NotSupported("create_signed_put_url"))
    }

    /// Presign a direct download.
    async fn create_signed_get_url(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, StorageError> {
        let _ = (bucket, key, expires_in);
        Err(StorageError::NotSupported("create_signed_get_url"))
    }
}
