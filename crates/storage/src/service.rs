use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::instrument;

use latchflow_crypto::sha256_hex;

use crate::driver::{GetOptions, PutRequest, SignedPutUrl, StorageDriver};
use crate::error::StorageError;

/// Stream of object bytes.
pub type ByteStream = BoxStream<'static, Result<Bytes, StorageError>>;

/// Result of a content-addressed PUT.
#[derive(Debug, Clone)]
pub struct PutResult {
    /// Derived storage key, `<prefix>/objects/sha256/<aa>/<bb>/<hex>`.
    pub storage_key: String,
    /// Hex SHA-256 of the body.
    pub sha256: String,
    pub size: u64,
    /// Backend etag, when the driver reports one.
    pub storage_etag: Option<String>,
}

/// Result of a HEAD through the service.
#[derive(Debug, Clone)]
pub struct HeadResult {
    pub size: u64,
    pub etag: Option<String>,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Content-addressed storage over a pluggable driver.
///
/// Keys are derived from the SHA-256 of the object bytes, so identical
/// content lands on the same key and PUTs are idempotent.
#[derive(Clone)]
pub struct StorageService {
    driver: Arc<dyn StorageDriver>,
    bucket: String,
    key_prefix: String,
}

impl std::fmt::Debug for StorageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageService")
            .field("bucket", &self.bucket)
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl StorageService {
    /// Create a service over `driver`. `key_prefix` may be empty.
    pub fn new(driver: Arc<dyn StorageDriver>, bucket: impl Into<String>, key_prefix: impl Into<String>) -> Self {
        Self {
            driver,
            bucket: bucket.into(),
            key_prefix: key_prefix.into(),
        }
    }

    /// Derive the content-addressed key for a body hash.
    ///
    /// Layout: `<prefix>/objects/sha256/<aa>/<bb>/<hex>`, where `aa`/`bb`
    /// are the first two hex byte pairs, fanning objects across directories.
    #[must_use]
    pub fn derive_key(&self, sha256: &str) -> String {
        let aa = &sha256[0..2];
        let bb = &sha256[2..4];
        if self.key_prefix.is_empty() {
            format!("objects/sha256/{aa}/{bb}/{sha256}")
        } else {
            format!("{}/objects/sha256/{aa}/{bb}/{sha256}", self.key_prefix)
        }
    }

    /// Store a body under its content hash.
    #[instrument(skip(self, body), fields(size = body.len()))]
    pub async fn put_file(
        &self,
        body: Bytes,
        content_type: &str,
    ) -> Result<PutResult, StorageError> {
        let sha256 = sha256_hex(&body);
        let storage_key = self.derive_key(&sha256);
        let size = body.len() as u64;

        let put = self
            .driver
            .put(PutRequest {
                bucket: self.bucket.clone(),
                key: storage_key.clone(),
                body,
                content_type: Some(content_type.to_owned()),
                metadata: HashMap::new(),
            })
            .await?;

        Ok(PutResult {
            storage_key,
            sha256,
            size: put.size.unwrap_or(size),
            storage_etag: put.etag,
        })
    }

    /// Stream an object by storage key.
    pub async fn get_file_stream(
        &self,
        storage_key: &str,
        range: Option<Range<u64>>,
    ) -> Result<ByteStream, StorageError> {
        self.driver
            .get_stream(&self.bucket, storage_key, GetOptions { range })
            .await
    }

    /// Read an entire object into memory.
    ///
    /// Used by the archive builder, which needs whole file bodies anyway;
    /// download responses stream instead.
    pub async fn get_file_bytes(&self, storage_key: &str) -> Result<Bytes, StorageError> {
        let mut stream = self.get_file_stream(storage_key, None).await?;
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(buf))
    }

    /// Object metadata by storage key.
    pub async fn head_file(&self, storage_key: &str) -> Result<HeadResult, StorageError> {
        let head = self.driver.head(&self.bucket, storage_key).await?;
        Ok(HeadResult {
            size: head.size,
            etag: head.etag,
            content_type: head.content_type,
            metadata: head.metadata,
        })
    }

    /// Delete an object by storage key.
    pub async fn delete_file(&self, storage_key: &str) -> Result<(), StorageError> {
        self.driver.delete(&self.bucket, storage_key).await
    }

    /// Whether the underlying driver can presign uploads.
    #[must_use]
    pub fn supports_signed_put(&self) -> bool {
        self.driver.supports_signed_put()
    }

    /// Presign a direct upload for a not-yet-hashed object key.
    pub async fn create_signed_put_url(
        &self,
        key: &str,
        content_type: Option<&str>,
        expires_in: std::time::Duration,
    ) -> Result<SignedPutUrl, StorageError> {
        self.driver
            .create_signed_put_url(&self.bucket, key, content_type, expires_in)
            .await
    }

    /// Presign a direct download.
    pub async fn create_signed_get_url(
        &self,
        key: &str,
        expires_in: std::time::Duration,
    ) -> Result<String, StorageError> {
        self.driver
            .create_signed_get_url(&self.bucket, key, expires_in)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorageDriver;

    fn service() -> StorageService {
        StorageService::new(Arc::new(MemoryStorageDriver::new()), "test-bucket", "lf")
    }

    #[test]
    fn derived_key_fans_out_by_hash_prefix() {
        let svc = service();
        let hash = "ab".to_owned() + &"cd".repeat(31);
        assert_eq!(
            svc.derive_key(&hash),
            format!("lf/objects/sha256/ab/cd/{hash}")
        );
    }

    #[test]
    fn derived_key_without_prefix() {
        let svc = StorageService::new(Arc::new(MemoryStorageDriver::new()), "b", "");
        let hash = "00".repeat(32);
        assert!(svc.derive_key(&hash).starts_with("objects/sha256/00/00/"));
    }

    #[tokio::test]
    async fn put_then_stream_roundtrip() {
        let svc = service();
        let body = Bytes::from_static(b"bundle archive bytes");
        let put = svc.put_file(body.clone(), "application/zip").await.unwrap();
        assert_eq!(put.sha256, latchflow_crypto::sha256_hex(&body));
        assert_eq!(put.size, body.len() as u64);

        let got = svc.get_file_bytes(&put.storage_key).await.unwrap();
        assert_eq!(got, body);

        let head = svc.head_file(&put.storage_key).await.unwrap();
        assert_eq!(head.size, body.len() as u64);
        assert_eq!(head.content_type.as_deref(), Some("application/zip"));
    }

    #[tokio::test]
    async fn identical_content_lands_on_same_key() {
        let svc = service();
        let a = svc.put_file(Bytes::from_static(b"same"), "text/plain").await.unwrap();
        let b = svc.put_file(Bytes::from_static(b"same"), "text/plain").await.unwrap();
        assert_eq!(a.storage_key, b.storage_key);
    }

    #[tokio::test]
    async fn ranged_get_returns_sub_slice() {
        let svc = service();
        let put = svc
            .put_file(Bytes::from_static(b"0123456789"), "text/plain")
            .await
            .unwrap();
        let mut stream = svc.get_file_stream(&put.storage_key, Some(2..6)).await.unwrap();
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(out, b"2345");
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let svc = service();
        let err = svc.get_file_bytes("lf/objects/sha256/aa/bb/nothing").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn presign_unsupported_by_memory_driver() {
        let svc = service();
        assert!(!svc.supports_signed_put());
        let err = svc
            .create_signed_put_url("k", None, std::time::Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotSupported(_)));
    }
}
