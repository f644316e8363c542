//! Storage backend selection

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which object store implementation backs the buckets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local in-memory buckets (tests and dry runs)
    Memory,
    /// One directory per bucket under `root`
    Local {
        /// Directory that holds the bucket directories
        root: PathBuf,
    },
    /// S3-compatible service such as MinIO
    S3 {
        /// Endpoint URL, e.g. `http://localhost:9000`
        endpoint: String,
        /// Region sent with signed requests
        #[serde(default = "default_region")]
        region: String,
        /// Access key id
        access_key: String,
        /// Secret access key
        secret_key: String,
        /// Allow plain HTTP endpoints
        #[serde(default = "default_allow_http")]
        allow_http: bool,
    },
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_allow_http() -> bool {
    true
}

impl StoreBackend {
    /// Short name used in logs and error messages
    pub fn name(&self) -> &'static str {
        match self {
            StoreBackend::Memory => "memory",
            StoreBackend::Local { .. } => "local",
            StoreBackend::S3 { .. } => "s3",
        }
    }

    /// Whether objects can carry a content type attribute
    pub fn supports_attributes(&self) -> bool {
        !matches!(self, StoreBackend::Local { .. })
    }

    /// Builds an S3 backend from a MinIO-style `host:port` endpoint
    pub fn minio(endpoint: &str, access_key: &str, secret_key: &str, secure: bool) -> Self {
        let endpoint = if endpoint.contains("://") {
            endpoint.to_string()
        } else if secure {
            format!("https://{endpoint}")
        } else {
            format!("http://{endpoint}")
        };

        StoreBackend::S3 {
            endpoint,
            region: default_region(),
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
            allow_http: !secure,
        }
    }
}

impl Default for StoreBackend {
    fn default() -> Self {
        StoreBackend::Local {
            root: PathBuf::from("/var/lib/histoflow/buckets"),
        }
    }
}
