use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("Invalid object key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Invalid bucket name: {0}")]
    InvalidBucket(String),

    #[error("S3 {operation} failed: {message}")]
    Service { operation: String, message: String },

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// True when the bucket or the object itself does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound { .. }
                | StoreError::BucketNotFound(_)
                | StoreError::ObjectStore(object_store::Error::NotFound { .. })
        )
    }

    /// Rewrites a backend `NotFound` into the bucket/key form used by callers
    pub(crate) fn locate(self, bucket: &str, key: &str) -> Self {
        match self {
            StoreError::ObjectStore(object_store::Error::NotFound { .. }) => StoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for std::io::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Io(io_err) => io_err,
            StoreError::NotFound { .. } | StoreError::BucketNotFound(_) => {
                std::io::Error::new(std::io::ErrorKind::NotFound, err)
            }
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }
}
