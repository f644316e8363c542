//! Error types for tiler-core

use crate::encoder::EncodeError;
use std::fmt;
use thiserror::Error;
use tiler_store::StoreError;

/// Pipeline stage in which a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Fetching source metadata and body
    Download,
    /// Running the pyramid encoder
    Tiling,
    /// Uploading the tile tree
    Upload,
    /// Writing `metadata.json`
    Metadata,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Download => "download",
            Stage::Tiling => "tiling",
            Stage::Upload => "upload",
            Stage::Metadata => "metadata",
        };
        f.write_str(name)
    }
}

/// Core error types for the tiling pipeline
#[derive(Error, Debug)]
pub enum Error {
    /// The source object does not exist in the source bucket
    #[error("Source not found: {bucket}/{key}")]
    SourceNotFound { bucket: String, key: String },

    /// The object store could not be reached or refused the request
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

    /// The encoder rejected or could not process the source image
    #[error("Encoding failed: {0}")]
    Encoding(#[from] EncodeError),

    /// A tile could not be uploaded or the destination bucket could not be created
    #[error("Upload failed: {context}: {source}")]
    Upload {
        context: String,
        #[source]
        source: StoreError,
    },

    /// The metadata record could not be written
    #[error("Metadata write failed: {0}")]
    MetadataWrite(String),

    /// The job description is malformed
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// The job was cancelled before a stage started
    #[error("Cancelled before {stage} stage")]
    Cancelled { stage: Stage },

    /// Configuration-related error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking task panicked or was aborted
    #[error("Worker task failed: {0}")]
    Task(String),
}

impl Error {
    /// Classifies a store error seen while fetching the source object
    pub fn from_download(err: StoreError, bucket: &str, key: &str) -> Self {
        if err.is_not_found() {
            Error::SourceNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }
        } else {
            Error::StoreUnavailable(err)
        }
    }

    /// Wraps a store error seen while uploading
    pub fn upload(context: impl Into<String>, source: StoreError) -> Self {
        Error::Upload {
            context: context.into(),
            source,
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Task(err.to_string())
    }
}

impl From<walkdir::Error> for Error {
    fn from(err: walkdir::Error) -> Self {
        Error::Io(err.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
