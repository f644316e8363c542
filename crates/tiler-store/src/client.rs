//! The bucket/key client interface consumed by the tiling pipeline

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::Path;

/// Metadata returned by [`ObjectStoreClient::stat_object`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Object size in bytes
    pub size: u64,
    /// Content type recorded with the object, when the backend keeps one
    pub content_type: Option<String>,
    /// Integrity tag
    pub etag: Option<String>,
    /// Last modification time
    pub last_modified: DateTime<Utc>,
}

/// One entry of [`ObjectStoreClient::list_objects`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectListing {
    /// Full key inside the bucket
    pub key: String,
    /// Object size in bytes
    pub size: u64,
}

/// Bucket-addressed object storage.
///
/// Implementations are built once per process and shared across concurrently
/// running jobs, so every method takes `&self`.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync + std::fmt::Debug {
    /// Fetches object metadata; `NotFound` when the key or bucket is absent
    async fn stat_object(&self, bucket: &str, key: &str) -> Result<ObjectInfo>;

    /// Streams an object body into `local_path`, creating parent directories
    async fn download_object(&self, bucket: &str, key: &str, local_path: &Path) -> Result<()>;

    /// Returns true when the bucket exists
    async fn bucket_exists(&self, bucket: &str) -> Result<bool>;

    /// Creates a bucket. Creating an existing bucket is not an error.
    async fn create_bucket(&self, bucket: &str) -> Result<()>;

    /// Uploads a local file, returning the number of bytes written
    async fn upload_file(&self, bucket: &str, key: &str, local_path: &Path) -> Result<u64>;

    /// Uploads an in-memory payload tagged with `content_type`
    async fn upload_bytes(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<()>;

    /// Reads a whole object into memory
    async fn read_object(&self, bucket: &str, key: &str) -> Result<Bytes>;

    /// Lists every object whose key starts with `prefix`
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectListing>>;
}
