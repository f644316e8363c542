//! `object_store`-backed implementation of [`ObjectStoreClient`]

use crate::backend::StoreBackend;
use crate::client::{ObjectInfo, ObjectListing, ObjectStoreClient};
use crate::content_type::guess_content_type;
use crate::s3_admin::S3Buckets;
use crate::{Result, StoreConfig, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{
    Attribute, Attributes, GetOptions, GetResult, ObjectStore, PutMultipartOpts, PutOptions,
    PutPayload, WriteMultipart,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

/// A set of named buckets on top of one storage backend.
///
/// Each bucket maps to its own `ObjectStore` instance. Instances are built
/// lazily and cached; for the in-memory backend the cache *is* the bucket
/// namespace. S3 buckets are looked up and created through the AWS SDK.
#[derive(Debug)]
pub struct BucketStore {
    backend: StoreBackend,
    config: StoreConfig,
    buckets: RwLock<HashMap<String, Arc<dyn ObjectStore>>>,
    s3: Option<S3Buckets>,
}

impl BucketStore {
    /// Create a store for the given backend
    ///
    /// # Errors
    /// Returns an error if the local root directory cannot be created
    pub fn new(backend: StoreBackend, config: StoreConfig) -> Result<Self> {
        let s3 = match &backend {
            StoreBackend::Local { root } => {
                std::fs::create_dir_all(root)?;
                None
            }
            StoreBackend::S3 {
                endpoint,
                region,
                access_key,
                secret_key,
                ..
            } => Some(S3Buckets::new(endpoint, region, access_key, secret_key)),
            StoreBackend::Memory => None,
        };

        debug!("Initialized {} bucket store", backend.name());
        Ok(Self {
            backend,
            config,
            buckets: RwLock::new(HashMap::new()),
            s3,
        })
    }

    /// An empty in-memory store with default configuration
    pub fn memory() -> Self {
        Self {
            backend: StoreBackend::Memory,
            config: StoreConfig::default(),
            buckets: RwLock::new(HashMap::new()),
            s3: None,
        }
    }

    /// The backend this store writes to
    pub fn backend(&self) -> &StoreBackend {
        &self.backend
    }

    /// Resolve the `ObjectStore` serving `bucket`
    async fn store_for(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        validate_bucket(bucket)?;

        if let Some(store) = self.buckets.read().await.get(bucket) {
            return Ok(Arc::clone(store));
        }

        let store: Arc<dyn ObjectStore> = match &self.backend {
            StoreBackend::Memory => return Err(StoreError::BucketNotFound(bucket.to_string())),
            StoreBackend::Local { root } => {
                let dir = root.join(bucket);
                let is_dir = tokio::fs::metadata(&dir)
                    .await
                    .map(|meta| meta.is_dir())
                    .unwrap_or(false);
                if !is_dir {
                    return Err(StoreError::BucketNotFound(bucket.to_string()));
                }
                Arc::new(LocalFileSystem::new_with_prefix(&dir)?)
            }
            StoreBackend::S3 {
                endpoint,
                region,
                access_key,
                secret_key,
                allow_http,
            } => Arc::new(
                AmazonS3Builder::new()
                    .with_bucket_name(bucket)
                    .with_endpoint(endpoint)
                    .with_region(region)
                    .with_access_key_id(access_key)
                    .with_secret_access_key(secret_key)
                    .with_allow_http(*allow_http)
                    .build()?,
            ),
        };

        let mut buckets = self.buckets.write().await;
        Ok(Arc::clone(
            buckets.entry(bucket.to_string()).or_insert(store),
        ))
    }

    fn s3_buckets(&self) -> Result<&S3Buckets> {
        self.s3.as_ref().ok_or_else(|| StoreError::Service {
            operation: "bucket management".to_string(),
            message: "S3 client was not initialized".to_string(),
        })
    }

    fn attributes_for(&self, content_type: &str) -> Attributes {
        let mut attributes = Attributes::new();
        if self.backend.supports_attributes() {
            attributes.insert(Attribute::ContentType, content_type.to_string().into());
        }
        attributes
    }

    async fn upload_multipart(
        &self,
        store: &Arc<dyn ObjectStore>,
        path: &ObjectPath,
        local_path: &Path,
        attributes: Attributes,
    ) -> Result<()> {
        debug!("Starting multipart upload for {}", path);
        let opts = PutMultipartOpts {
            attributes,
            ..Default::default()
        };
        let upload = store.put_multipart_opts(path, opts).await?;
        let mut writer = WriteMultipart::new_with_chunk_size(upload, self.config.part_size);

        let copied = async {
            let mut file = tokio::fs::File::open(local_path).await?;
            let mut buffer = vec![0u8; self.config.part_size];
            loop {
                let n = file.read(&mut buffer).await?;
                if n == 0 {
                    break;
                }
                writer
                    .wait_for_capacity(self.config.max_concurrent_parts)
                    .await?;
                writer.write(&buffer[..n]);
                trace!("Queued {} bytes for {}", n, path);
            }
            Ok::<_, StoreError>(())
        }
        .await;

        match copied {
            Ok(()) => {
                writer.finish().await?;
                debug!("Completed multipart upload for {}", path);
                Ok(())
            }
            Err(err) => {
                if let Err(abort_err) = writer.abort().await {
                    warn!("Failed to abort multipart upload for {}: {}", path, abort_err);
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl ObjectStoreClient for BucketStore {
    async fn stat_object(&self, bucket: &str, key: &str) -> Result<ObjectInfo> {
        let store = self.store_for(bucket).await?;
        let path = parse_key(key)?;

        let options = GetOptions {
            head: true,
            ..Default::default()
        };
        let GetResult {
            meta, attributes, ..
        } = store
            .get_opts(&path, options)
            .await
            .map_err(|e| StoreError::from(e).locate(bucket, key))?;

        Ok(ObjectInfo {
            size: meta.size as u64,
            content_type: attributes
                .get(&Attribute::ContentType)
                .map(|value| value.to_string()),
            etag: meta.e_tag,
            last_modified: meta.last_modified,
        })
    }

    async fn download_object(&self, bucket: &str, key: &str, local_path: &Path) -> Result<()> {
        let store = self.store_for(bucket).await?;
        let path = parse_key(key)?;

        let result = store
            .get(&path)
            .await
            .map_err(|e| StoreError::from(e).locate(bucket, key))?;

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(local_path).await?;
        let mut stream = result.into_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!("Downloaded {} bytes from {}/{}", written, bucket, key);
        Ok(())
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        validate_bucket(bucket)?;

        match &self.backend {
            StoreBackend::Memory => Ok(self.buckets.read().await.contains_key(bucket)),
            StoreBackend::Local { root } => Ok(tokio::fs::metadata(root.join(bucket))
                .await
                .map(|meta| meta.is_dir())
                .unwrap_or(false)),
            StoreBackend::S3 { .. } => self.s3_buckets()?.exists(bucket).await,
        }
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        validate_bucket(bucket)?;

        match &self.backend {
            StoreBackend::Memory => {
                let mut buckets = self.buckets.write().await;
                buckets
                    .entry(bucket.to_string())
                    .or_insert_with(|| Arc::new(InMemory::new()));
            }
            StoreBackend::Local { root } => {
                tokio::fs::create_dir_all(root.join(bucket)).await?;
            }
            StoreBackend::S3 { .. } => self.s3_buckets()?.create(bucket).await?,
        }

        debug!("Bucket '{}' is available", bucket);
        Ok(())
    }

    async fn upload_file(&self, bucket: &str, key: &str, local_path: &Path) -> Result<u64> {
        let store = self.store_for(bucket).await?;
        let path = parse_key(key)?;
        let size = tokio::fs::metadata(local_path).await?.len();
        let attributes = self.attributes_for(guess_content_type(key));

        if size > self.config.multipart_threshold as u64 {
            self.upload_multipart(&store, &path, local_path, attributes)
                .await?;
        } else {
            let data = tokio::fs::read(local_path).await?;
            let opts = PutOptions {
                attributes,
                ..Default::default()
            };
            store.put_opts(&path, PutPayload::from(data), opts).await?;
        }

        trace!("Uploaded {} ({} bytes) to {}/{}", local_path.display(), size, bucket, key);
        Ok(size)
    }

    async fn upload_bytes(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<()> {
        let store = self.store_for(bucket).await?;
        let path = parse_key(key)?;
        let len = bytes.len();

        let opts = PutOptions {
            attributes: self.attributes_for(content_type),
            ..Default::default()
        };
        store.put_opts(&path, PutPayload::from(bytes), opts).await?;

        debug!("Uploaded {} bytes to {}/{}", len, bucket, key);
        Ok(())
    }

    async fn read_object(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let store = self.store_for(bucket).await?;
        let path = parse_key(key)?;

        let result = store
            .get(&path)
            .await
            .map_err(|e| StoreError::from(e).locate(bucket, key))?;
        Ok(result.bytes().await?)
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectListing>> {
        let store = self.store_for(bucket).await?;
        let prefix = if prefix.trim_matches('/').is_empty() {
            None
        } else {
            Some(parse_key(prefix)?)
        };

        let metas: Vec<_> = store.list(prefix.as_ref()).try_collect().await?;
        let mut listings: Vec<ObjectListing> = metas
            .into_iter()
            .map(|meta| ObjectListing {
                key: meta.location.to_string(),
                size: meta.size as u64,
            })
            .collect();
        listings.sort_by(|a, b| a.key.cmp(&b.key));

        Ok(listings)
    }
}

fn parse_key(key: &str) -> Result<ObjectPath> {
    ObjectPath::parse(key).map_err(|e| StoreError::InvalidKey {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn validate_bucket(bucket: &str) -> Result<()> {
    let valid = !bucket.is_empty()
        && bucket != "."
        && bucket != ".."
        && bucket
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidBucket(bucket.to_string()))
    }
}
