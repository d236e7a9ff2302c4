//! Content-addressed object storage for Latchflow.
//!
//! The [`StorageService`] owns key derivation and content hashing; the
//! [`StorageDriver`] trait is the seam concrete backends (filesystem, S3)
//! plug into. Only the in-memory driver ships here -- it backs the test
//! suites and documents the contract.

mod driver;
mod error;
mod memory;
mod service;

pub use driver::{
    DriverHead, DriverPut, GetOptions, PutRequest, SignedPutUrl, StorageDriver,
};
pub use error::StorageError;
pub use memory::MemoryStorageDriver;
pub use service::{ByteStream, HeadResult, PutResult, StorageService};
