use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{self, BoxStream};

use latchflow_crypto::sha256_hex;

use crate::driver::{DriverHead, DriverPut, GetOptions, PutRequest, StorageDriver};
use crate::error::StorageError;

#[derive(Debug, Clone)]
struct StoredObject {
    body: Bytes,
    content_type: Option<String>,
    metadata: HashMap<String, String>,
    etag: String,
}

/// In-memory storage driver.
///
/// Backs the test suites and serves as the reference implementation of the
/// driver contract. Etags are the hex SHA-256 of the body, mirroring what
/// object stores report for single-part uploads.
#[derive(Debug, Default)]
pub struct MemoryStorageDriver {
    objects: DashMap<(String, String), StoredObject>,
}

impl MemoryStorageDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects, across all buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl StorageDriver for MemoryStorageDriver {
    async fn put(&self, req: PutRequest) -> Result<DriverPut, StorageError> {
        let etag = sha256_hex(&req.body);
        let size = req.body.len() as u64;
        self.objects.insert(
            (req.bucket, req.key),
            StoredObject {
                body: req.body,
                content_type: req.content_type,
                metadata: req.metadata,
                etag: etag.clone(),
            },
        );
        Ok(DriverPut {
            etag: Some(etag),
            size: Some(size),
        })
    }

    async fn get_stream(
        &self,
        bucket: &str,
        key: &str,
        opts: GetOptions,
    ) -> Result<BoxStream<'static, Result<Bytes, StorageError>>, StorageError> {
        let obj = self
            .objects
            .get(&(bucket.to_owned(), key.to_owned()))
            .ok_or_else(|| StorageError::NotFound(key.to_owned()))?;

        let body = match opts.range {
            None => obj.body.clone(),
            Some(range) => {
                let len = obj.body.len() as u64;
                if range.start > range.end || range.end > len {
                    return Err(StorageError::InvalidRange {
                        key: key.to_owned(),
                        detail: format!("{}..{} outside 0..{len}", range.start, range.end),
                    });
                }
                obj.body.slice(range.start as usize..range.end as usize)
            }
        };

        // Chunk the body so consumers exercise real multi-chunk streaming.
        let chunks: Vec<Result<Bytes, StorageError>> = body
            .chunks(64 * 1024)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<DriverHead, StorageError> {
        let obj = self
            .objects
            .get(&(bucket.to_owned(), key.to_owned()))
            .ok_or_else(|| StorageError::NotFound(key.to_owned()))?;
        Ok(DriverHead {
            size: obj.body.len() as u64,
            etag: Some(obj.etag.clone()),
            content_type: obj.content_type.clone(),
            metadata: obj.metadata.clone(),
            checksum_sha256_hex: Some(obj.etag.clone()),
        })
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        self.objects.remove(&(bucket.to_owned(), key.to_owned()));
        Ok(())
    }

    async fn copy_object(
        &self,
        bucket: &str,
        from_key: &str,
        to_key: &str,
    ) -> Result<(), StorageError> {
        let obj = self
            .objects
            .get(&(bucket.to_owned(), from_key.to_owned()))
            .ok_or_else(|| StorageError::NotFound(from_key.to_owned()))?
            .clone();
        self.objects.insert((bucket.to_owned(), to_key.to_owned()), obj);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delete_is_idempotent() {
        let driver = MemoryStorageDriver::new();
        driver.delete("b", "missing").await.unwrap();
    }

    #[tokio::test]
    async fn copy_duplicates_the_object() {
        let driver = MemoryStorageDriver::new();
        driver
            .put(PutRequest {
                bucket: "b".into(),
                key: "src".into(),
                body: Bytes::from_static(b"data"),
                content_type: None,
                metadata: HashMap::new(),
            })
            .await
            .unwrap();
        driver.copy_object("b", "src", "dst").await.unwrap();
        let head = driver.head("b", "dst").await.unwrap();
        assert_eq!(head.size, 4);
    }

    #[tokio::test]
    async fn invalid_range_is_rejected() {
        let driver = MemoryStorageDriver::new();
        driver
            .put(PutRequest {
                bucket: "b".into(),
                key: "k".into(),
                body: Bytes::from_static(b"1234"),
                content_type: None,
                metadata: HashMap::new(),
            })
            .await
            .unwrap();
        let err = match driver
            .get_stream("b", "k", GetOptions { range: Some(2..10) })
            .await
        {
            Err(e) => e,
            Ok(_) => panic!("expected get_stream to reject an invalid range"),
        };
        assert!(matches!(err, StorageError::InvalidRange { .. }));
    }
}
