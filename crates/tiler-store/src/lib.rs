//! # tiler-store
//!
//! Bucket-oriented object storage for the HistoFlow tiler. The tiling pipeline
//! talks to storage only through the [`ObjectStoreClient`] trait: stat, download,
//! upload, and create-if-absent buckets.
//!
//! ## Architecture
//!
//! - [`ObjectStoreClient`]: the async interface the pipeline consumes
//! - [`BucketStore`]: the implementation, one `object_store` instance per bucket,
//!   backed by memory, a local directory tree, or an S3-compatible service (MinIO)
//!
//! A `BucketStore` is built once at startup and shared behind an `Arc` by every
//! concurrently running job.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

mod backend;
mod bucket_store;
mod client;
pub mod content_type;
mod error;
mod s3_admin;

pub use backend::StoreBackend;
pub use bucket_store::BucketStore;
pub use client::{ObjectInfo, ObjectListing, ObjectStoreClient};
pub use error::{Result, StoreError};

use serde::{Deserialize, Serialize};

/// Tuning for uploads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Files above this size use multipart upload (default: 64MB)
    pub multipart_threshold: usize,
    /// Size of each multipart part in bytes (default: 8MB)
    pub part_size: usize,
    /// Parts in flight per multipart upload (default: 4)
    pub max_concurrent_parts: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            multipart_threshold: 64 * 1024 * 1024, // 64MB
            part_size: 8 * 1024 * 1024,            // 8MB
            max_concurrent_parts: 4,
        }
    }
}
