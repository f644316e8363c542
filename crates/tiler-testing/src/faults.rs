//! Call counting and fault injection around an [`ObjectStoreClient`]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tiler_store::{ObjectInfo, ObjectListing, ObjectStoreClient, Result, StoreError};

/// Operations that can be counted or failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Stat,
    Download,
    BucketExists,
    CreateBucket,
    UploadFile,
    UploadBytes,
    ReadObject,
    ListObjects,
}

/// Callback run before each `upload_file`
#[derive(Clone)]
struct UploadHook(Arc<dyn Fn() + Send + Sync>);

impl fmt::Debug for UploadHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UploadHook")
    }
}

#[derive(Debug, Default)]
struct State {
    calls: HashMap<StoreOp, usize>,
    failing: Vec<StoreOp>,
    fail_uploads_after: Option<usize>,
    failing_key_suffixes: Vec<String>,
    uploaded_keys: Vec<String>,
    lose_create_race: bool,
    upload_hook: Option<UploadHook>,
}

/// Wraps a real store, counting calls and failing the ones it is told to.
///
/// Injected failures are `StoreError::Io` with `ConnectionRefused`, which the
/// pipeline treats as an unreachable store.
#[derive(Debug, Clone)]
pub struct InstrumentedStore {
    inner: Arc<dyn ObjectStoreClient>,
    state: Arc<Mutex<State>>,
}

impl InstrumentedStore {
    pub fn new(inner: Arc<dyn ObjectStoreClient>) -> Self {
        Self {
            inner,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Every call of `op` fails from now on
    pub fn fail(&self, op: StoreOp) {
        self.state().failing.push(op);
    }

    /// `upload_file` succeeds `n` times, then fails
    pub fn fail_uploads_after(&self, n: usize) {
        self.state().fail_uploads_after = Some(n);
    }

    /// Uploads of keys ending in `suffix` fail
    pub fn fail_keys_ending_with(&self, suffix: &str) {
        self.state().failing_key_suffixes.push(suffix.to_string());
    }

    /// `create_bucket` creates the bucket, then reports a failure, as if a
    /// concurrent caller had created it first
    pub fn lose_create_bucket_race(&self) {
        self.state().lose_create_race = true;
    }

    /// Run `hook` at the start of every `upload_file` call
    pub fn on_upload(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.state().upload_hook = Some(UploadHook(Arc::new(hook)));
    }

    /// Number of times `op` was invoked, failed calls included
    pub fn calls(&self, op: StoreOp) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    /// Keys successfully written through `upload_file` and `upload_bytes`
    pub fn uploaded_keys(&self) -> Vec<String> {
        self.state().uploaded_keys.clone()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn enter(&self, op: StoreOp, key: Option<&str>) -> Result<()> {
        let mut state = self.state();
        let count = state.calls.entry(op).or_insert(0);
        *count += 1;
        let count = *count;

        let upload_limit_hit = op == StoreOp::UploadFile
            && state.fail_uploads_after.is_some_and(|limit| count > limit);
        let key_hit = key.is_some_and(|key| {
            state
                .failing_key_suffixes
                .iter()
                .any(|suffix| key.ends_with(suffix.as_str()))
        });

        if state.failing.contains(&op) || upload_limit_hit || key_hit {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("injected {op:?} failure"),
            )));
        }
        Ok(())
    }

    fn record_upload(&self, key: &str) {
        self.state().uploaded_keys.push(key.to_string());
    }
}

#[async_trait]
impl ObjectStoreClient for InstrumentedStore {
    async fn stat_object(&self, bucket: &str, key: &str) -> Result<ObjectInfo> {
        self.enter(StoreOp::Stat, Some(key))?;
        self.inner.stat_object(bucket, key).await
    }

    async fn download_object(&self, bucket: &str, key: &str, local_path: &Path) -> Result<()> {
        self.enter(StoreOp::Download, Some(key))?;
        self.inner.download_object(bucket, key, local_path).await
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        self.enter(StoreOp::BucketExists, None)?;
        self.inner.bucket_exists(bucket).await
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        self.enter(StoreOp::CreateBucket, None)?;
        self.inner.create_bucket(bucket).await?;
        if self.state().lose_create_race {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("bucket '{bucket}' was created by another caller"),
            )));
        }
        Ok(())
    }

    async fn upload_file(&self, bucket: &str, key: &str, local_path: &Path) -> Result<u64> {
        let hook = self.state().upload_hook.clone();
        if let Some(UploadHook(hook)) = hook {
            hook();
        }
        self.enter(StoreOp::UploadFile, Some(key))?;
        let written = self.inner.upload_file(bucket, key, local_path).await?;
        self.record_upload(key);
        Ok(written)
    }

    async fn upload_bytes(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<()> {
        self.enter(StoreOp::UploadBytes, Some(key))?;
        self.inner
            .upload_bytes(bucket, key, bytes, content_type)
            .await?;
        self.record_upload(key);
        Ok(())
    }

    async fn read_object(&self, bucket: &str, key: &str) -> Result<Bytes> {
        self.enter(StoreOp::ReadObject, Some(key))?;
        self.inner.read_object(bucket, key).await
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectListing>> {
        self.enter(StoreOp::ListObjects, None)?;
        self.inner.list_objects(bucket, prefix).await
    }
}
