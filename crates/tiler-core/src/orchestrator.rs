//! The per-job tiling pipeline
//!
//! ```text
//! download -> tiling -> upload -> metadata
//!     \__________\__________\__________\____ cleanup (always)
//! ```
//!
//! Stages run strictly in order. A failure in download, tiling or upload
//! aborts the job; a metadata failure is logged but the job still counts as
//! completed because the tiles are already published. The working area is
//! removed in every case.

use crate::config::{ServiceConfig, DEFAULT_TEMP_STORAGE_PATH, DEFAULT_UPLOAD_BUCKET};
use crate::encoder::{EncodeOptions, PyramidEncoder, PyramidLayout};
use crate::error::{Error, Result, Stage};
use crate::job::{StageTiming, TileUploadSummary, TilingJob, TimingsRecord};
use crate::locks::ImageLocks;
use crate::metadata::{metadata_key, JobMetadataRecord};
use crate::status::StatusRegistry;
use crate::working_area::WorkingArea;
use bytes::Bytes;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tiler_store::{content_type, ObjectInfo, ObjectStoreClient};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use walkdir::WalkDir;

/// Settings shared by every job
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    /// Parent of the per-job working areas
    pub temp_root: PathBuf,
    /// Bucket receiving tile sets
    pub upload_bucket: String,
    pub encode: EncodeOptions,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            temp_root: PathBuf::from(DEFAULT_TEMP_STORAGE_PATH),
            upload_bucket: DEFAULT_UPLOAD_BUCKET.to_string(),
            encode: EncodeOptions::default(),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            temp_root: config.tiling.temp_storage_path.clone(),
            upload_bucket: config.upload.bucket.clone(),
            encode: EncodeOptions::default(),
        }
    }
}

/// Whether `metadata.json` made it to the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataState {
    Written { bucket: String, key: String },
    Failed(String),
}

impl MetadataState {
    /// `bucket/key` of the written record
    pub fn path(&self) -> Option<String> {
        match self {
            MetadataState::Written { bucket, key } => Some(format!("{bucket}/{key}")),
            MetadataState::Failed(_) => None,
        }
    }
}

/// Result of a job whose tiles were published
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub image_id: String,
    pub source: ObjectInfo,
    pub levels: usize,
    pub uploaded: TileUploadSummary,
    pub timings: TimingsRecord,
    pub metadata: MetadataState,
}

/// A job that stopped in `stage`
#[derive(Debug)]
pub struct JobFailure {
    pub image_id: String,
    pub stage: Stage,
    pub error: Error,
}

/// What happened to a job. Callers of the pipeline are free to ignore it.
#[derive(Debug)]
pub enum JobOutcome {
    Completed(JobSummary),
    Failed(JobFailure),
}

impl JobOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, JobOutcome::Completed(_))
    }

    pub fn image_id(&self) -> &str {
        match self {
            JobOutcome::Completed(summary) => &summary.image_id,
            JobOutcome::Failed(failure) => &failure.image_id,
        }
    }
}

/// Runs tiling jobs against a shared store client and encoder
#[derive(Debug)]
pub struct TilingOrchestrator {
    store: Arc<dyn ObjectStoreClient>,
    encoder: Arc<dyn PyramidEncoder>,
    settings: OrchestratorSettings,
    locks: ImageLocks,
    status: Option<StatusRegistry>,
}

impl TilingOrchestrator {
    pub fn new(
        store: Arc<dyn ObjectStoreClient>,
        encoder: Arc<dyn PyramidEncoder>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            encoder,
            settings,
            locks: ImageLocks::new(),
            status: None,
        }
    }

    /// Report stage transitions of scheduled submissions to `registry`
    pub fn with_status(mut self, registry: StatusRegistry) -> Self {
        self.status = Some(registry);
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn ObjectStoreClient> {
        &self.store
    }

    /// Run one job to completion. Never fails; the outcome says what happened.
    pub async fn process_image(&self, job: TilingJob) -> JobOutcome {
        self.process_image_with_cancel(job, CancellationToken::new())
            .await
    }

    /// Like [`process_image`](Self::process_image), checking `cancel` before
    /// each stage
    pub async fn process_image_with_cancel(
        &self,
        job: TilingJob,
        cancel: CancellationToken,
    ) -> JobOutcome {
        let span = info_span!("tiling_job", image_id = %job.image_id);
        self.run(job, None, cancel).instrument(span).await
    }

    /// Run a job accepted by the scheduler, reporting progress to the status
    /// registry under `submission`
    pub async fn process_submission(
        &self,
        job: TilingJob,
        submission: u64,
        cancel: CancellationToken,
    ) -> JobOutcome {
        let span = info_span!("tiling_job", image_id = %job.image_id, submission);
        self.run(job, Some(submission), cancel)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        job: TilingJob,
        submission: Option<u64>,
        cancel: CancellationToken,
    ) -> JobOutcome {
        let _guard = self.locks.acquire(&job.image_id).await;
        info!(
            "Starting tiling job for {}/{}",
            job.source_bucket, job.source_object_name
        );

        let result = match self.prepare(&job).await {
            Ok(area) => {
                let result = self.run_stages(&job, submission, &area, &cancel).await;
                self.cleanup(area).await;
                result
            }
            Err(err) => Err(JobFailure {
                image_id: job.image_id.clone(),
                stage: Stage::Download,
                error: err,
            }),
        };

        match result {
            Ok(summary) => {
                info!(
                    tile_file_count = summary.uploaded.file_count,
                    tile_total_size_bytes = summary.uploaded.total_bytes,
                    total_seconds = summary.timings.total_seconds,
                    "Tiling job completed"
                );
                self.report(submission, |status, submission| {
                    status.mark_completed(&job.image_id, submission, summary.metadata.path());
                });
                JobOutcome::Completed(summary)
            }
            Err(failure) => {
                error!(stage = %failure.stage, "Tiling job failed: {}", failure.error);
                self.report(submission, |status, submission| {
                    status.mark_failed(
                        &job.image_id,
                        submission,
                        failure.stage,
                        failure.error.to_string(),
                    );
                });
                JobOutcome::Failed(failure)
            }
        }
    }

    async fn prepare(&self, job: &TilingJob) -> Result<WorkingArea> {
        job.validate()?;
        let temp_root = self.settings.temp_root.clone();
        let image_id = job.image_id.clone();
        let area =
            tokio::task::spawn_blocking(move || WorkingArea::create(&temp_root, &image_id))
                .await??;
        debug!("Working area at {}", area.root().display());
        Ok(area)
    }

    async fn run_stages(
        &self,
        job: &TilingJob,
        submission: Option<u64>,
        area: &WorkingArea,
        cancel: &CancellationToken,
    ) -> std::result::Result<JobSummary, JobFailure> {
        let fail = |stage: Stage| {
            let image_id = job.image_id.clone();
            move |error: Error| JobFailure {
                image_id,
                stage,
                error,
            }
        };
        let mut timing = StageTiming::default();

        self.enter(job, submission, cancel, Stage::Download)
            .map_err(fail(Stage::Download))?;
        let start = Instant::now();
        let (source, local_source) = self
            .download(job, area)
            .await
            .map_err(fail(Stage::Download))?;
        timing.download = start.elapsed().as_secs_f64();
        info!(
            source_size_bytes = source.size,
            download_seconds = timing.download,
            "Downloaded source"
        );

        self.enter(job, submission, cancel, Stage::Tiling)
            .map_err(fail(Stage::Tiling))?;
        let start = Instant::now();
        let layout = self
            .encode(local_source, area.tiles_dir())
            .await
            .map_err(fail(Stage::Tiling))?;
        timing.tiling = start.elapsed().as_secs_f64();
        info!(
            levels = layout.levels.len(),
            tiles = layout.tile_count(),
            tiling_seconds = timing.tiling,
            "Generated pyramid"
        );

        self.enter(job, submission, cancel, Stage::Upload)
            .map_err(fail(Stage::Upload))?;
        let start = Instant::now();
        let uploaded = self
            .upload(job, &area.tiles_dir())
            .await
            .map_err(fail(Stage::Upload))?;
        timing.upload = start.elapsed().as_secs_f64();
        info!(
            files = uploaded.file_count,
            bytes = uploaded.total_bytes,
            upload_seconds = timing.upload,
            "Uploaded tiles to {}",
            self.settings.upload_bucket
        );

        // Tiles are live from here on; cancellation no longer applies.
        self.mark(job, submission, Stage::Metadata);
        let metadata = match self.write_metadata(job, &source, uploaded, timing).await {
            Ok(key) => MetadataState::Written {
                bucket: self.settings.upload_bucket.clone(),
                key,
            },
            Err(err) => {
                warn!("Tiles are live but metadata was not written: {}", err);
                MetadataState::Failed(err.to_string())
            }
        };

        Ok(JobSummary {
            image_id: job.image_id.clone(),
            source,
            levels: layout.levels.len(),
            uploaded,
            timings: timing.rounded(),
            metadata,
        })
    }

    fn enter(
        &self,
        job: &TilingJob,
        submission: Option<u64>,
        cancel: &CancellationToken,
        stage: Stage,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled { stage });
        }
        self.mark(job, submission, stage);
        Ok(())
    }

    fn mark(&self, job: &TilingJob, submission: Option<u64>, stage: Stage) {
        self.report(submission, |status, submission| {
            status.mark_stage(&job.image_id, submission, stage);
        });
        debug!("Entering {} stage", stage);
    }

    fn report(&self, submission: Option<u64>, update: impl FnOnce(&StatusRegistry, u64)) {
        if let (Some(status), Some(submission)) = (&self.status, submission) {
            update(status, submission);
        }
    }

    async fn download(&self, job: &TilingJob, area: &WorkingArea) -> Result<(ObjectInfo, PathBuf)> {
        let bucket = job.source_bucket.as_str();
        let key = job.source_object_name.as_str();

        let info = self
            .store
            .stat_object(bucket, key)
            .await
            .map_err(|e| Error::from_download(e, bucket, key))?;

        let file_name = job.source_file_name().ok_or_else(|| {
            Error::InvalidJob(format!("source_object_name '{key}' has no file name"))
        })?;
        let local = area.source_path(file_name);

        self.store
            .download_object(bucket, key, &local)
            .await
            .map_err(|e| Error::from_download(e, bucket, key))?;

        Ok((info, local))
    }

    async fn encode(&self, source: PathBuf, output_dir: PathBuf) -> Result<PyramidLayout> {
        let encoder = Arc::clone(&self.encoder);
        let options = self.settings.encode.clone();
        let layout =
            tokio::task::spawn_blocking(move || encoder.encode(&source, &output_dir, &options))
                .await??;
        Ok(layout)
    }

    async fn upload(&self, job: &TilingJob, tiles_dir: &Path) -> Result<TileUploadSummary> {
        let bucket = self.settings.upload_bucket.as_str();
        self.ensure_bucket(bucket).await?;

        let root = tiles_dir.to_path_buf();
        let files = tokio::task::spawn_blocking(move || collect_files(&root)).await??;
        debug!("Uploading {} files", files.len());

        let mut summary = TileUploadSummary::default();
        for (path, relative) in files {
            let key = format!("{}/{}", job.image_id, relative);
            let bytes = self
                .store
                .upload_file(bucket, &key, &path)
                .await
                .map_err(|e| Error::upload(format!("uploading {bucket}/{key}"), e))?;
            summary.record(bytes);
        }

        Ok(summary)
    }

    /// Create the bucket when missing. Losing a creation race is fine.
    async fn ensure_bucket(&self, bucket: &str) -> Result<()> {
        let exists = self
            .store
            .bucket_exists(bucket)
            .await
            .map_err(|e| Error::upload(format!("checking bucket '{bucket}'"), e))?;
        if exists {
            return Ok(());
        }

        info!("Creating bucket '{}'", bucket);
        match self.store.create_bucket(bucket).await {
            Ok(()) => Ok(()),
            Err(err) => match self.store.bucket_exists(bucket).await {
                Ok(true) => {
                    debug!("Bucket '{}' was created concurrently", bucket);
                    Ok(())
                }
                _ => Err(Error::upload(format!("creating bucket '{bucket}'"), err)),
            },
        }
    }

    async fn write_metadata(
        &self,
        job: &TilingJob,
        source: &ObjectInfo,
        uploaded: TileUploadSummary,
        timing: StageTiming,
    ) -> Result<String> {
        let bucket = self.settings.upload_bucket.as_str();
        let record = JobMetadataRecord::new(job, source, bucket, uploaded, timing, Utc::now());
        let body = record
            .to_json()
            .map_err(|e| Error::MetadataWrite(e.to_string()))?;

        let key = metadata_key(&job.image_id);
        self.store
            .upload_bytes(bucket, &key, Bytes::from(body), content_type::JSON)
            .await
            .map_err(|e| Error::MetadataWrite(format!("{bucket}/{key}: {e}")))?;

        info!("Wrote metadata to {}/{}", bucket, key);
        Ok(key)
    }

    async fn cleanup(&self, area: WorkingArea) {
        let root = area.root().to_path_buf();
        match tokio::task::spawn_blocking(move || area.release()).await {
            Ok(Ok(())) => debug!("Cleaned up {}", root.display()),
            Ok(Err(err)) => warn!("Failed to clean up {}: {}", root.display(), err),
            Err(err) => warn!("Cleanup task for {} failed: {}", root.display(), err),
        }
    }
}

/// Regular files under `root`, depth first, with `/`-joined relative paths
fn collect_files(root: &Path) -> Result<Vec<(PathBuf, String)>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push((entry.path().to_path_buf(), relative));
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_collect_files_uses_forward_slashes() {
        let temp = tempfile::TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("image_files/0")).unwrap();
        fs::create_dir_all(root.join("image_files/1")).unwrap();
        fs::write(root.join("image.dzi"), b"<Image/>").unwrap();
        fs::write(root.join("image_files/0/0_0.jpg"), b"a").unwrap();
        fs::write(root.join("image_files/1/0_0.jpg"), b"b").unwrap();

        let relative: Vec<String> = collect_files(root)
            .unwrap()
            .into_iter()
            .map(|(_, rel)| rel)
            .collect();
        assert_eq!(
            relative,
            vec!["image.dzi", "image_files/0/0_0.jpg", "image_files/1/0_0.jpg"]
        );
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = ServiceConfig::default();
        config.upload.bucket = "tiles-dev".into();
        config.tiling.temp_storage_path = PathBuf::from("/scratch");

        let settings = OrchestratorSettings::from_config(&config);
        assert_eq!(settings.upload_bucket, "tiles-dev");
        assert_eq!(settings.temp_root, PathBuf::from("/scratch"));
        assert_eq!(settings.encode, EncodeOptions::default());
    }

    #[test]
    fn test_metadata_state_path() {
        let written = MetadataState::Written {
            bucket: "histoflow-tiles".into(),
            key: "slide-001/metadata.json".into(),
        };
        assert_eq!(
            written.path().as_deref(),
            Some("histoflow-tiles/slide-001/metadata.json")
        );
        assert_eq!(MetadataState::Failed("boom".into()).path(), None);
    }
}
