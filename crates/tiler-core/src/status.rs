//! In-process record of accepted jobs

use crate::error::Stage;
use crate::job::TilingJob;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Lifecycle of an accepted job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    /// Accepted, waiting for a worker
    Pending,
    /// Running the given stage
    InProgress { stage: Stage },
    /// Tiles uploaded
    Completed,
    /// Aborted in the given stage
    Failed { stage: Stage },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::InProgress { .. } => "in_progress",
            JobState::Completed => "completed",
            JobState::Failed { .. } => "failed",
        }
    }
}

/// Latest known status of one job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub image_id: String,
    /// Increases with every accepted submission; updates from older runs of
    /// the same `image_id` are dropped
    pub submission: u64,
    pub dataset_name: Option<String>,
    pub source_bucket: String,
    pub source_object_name: String,
    #[serde(flatten)]
    pub state: JobState,
    pub failure_reason: Option<String>,
    /// `bucket/key` of the metadata record once written
    pub metadata_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Thread-safe map from `image_id` to its latest status.
///
/// A re-submitted `image_id` replaces the previous entry. Every update names
/// the submission it belongs to, so a superseded run cannot overwrite the
/// entry of the submission that replaced it.
#[derive(Debug, Clone, Default)]
pub struct StatusRegistry {
    inner: Arc<RwLock<Entries>>,
}

#[derive(Debug, Default)]
struct Entries {
    last_submission: u64,
    jobs: HashMap<String, JobStatus>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `job` as pending if `enqueue` accepts it.
    ///
    /// `enqueue` receives the new submission number and runs under the
    /// registry lock, so no update for that submission can arrive before the
    /// pending entry exists. On rejection the registry is left untouched.
    pub fn admit<E>(
        &self,
        job: &TilingJob,
        enqueue: impl FnOnce(u64) -> Result<(), E>,
    ) -> Result<u64, E> {
        let mut entries = self.write();
        let submission = entries.last_submission + 1;
        enqueue(submission)?;

        let now = Utc::now();
        let status = JobStatus {
            image_id: job.image_id.clone(),
            submission,
            dataset_name: job.dataset_name.clone(),
            source_bucket: job.source_bucket.clone(),
            source_object_name: job.source_object_name.clone(),
            state: JobState::Pending,
            failure_reason: None,
            metadata_path: None,
            created_at: now,
            updated_at: now,
        };
        entries.last_submission = submission;
        entries.jobs.insert(job.image_id.clone(), status);
        Ok(submission)
    }

    /// Record `job` as pending unconditionally
    pub fn record_pending(&self, job: &TilingJob) -> u64 {
        match self.admit(job, |_| Ok::<(), std::convert::Infallible>(())) {
            Ok(submission) => submission,
            Err(never) => match never {},
        }
    }

    pub fn mark_stage(&self, image_id: &str, submission: u64, stage: Stage) {
        self.update(image_id, submission, |status| {
            status.state = JobState::InProgress { stage };
        });
    }

    pub fn mark_completed(&self, image_id: &str, submission: u64, metadata_path: Option<String>) {
        self.update(image_id, submission, |status| {
            status.state = JobState::Completed;
            status.metadata_path = metadata_path;
        });
    }

    pub fn mark_failed(
        &self,
        image_id: &str,
        submission: u64,
        stage: Stage,
        reason: impl Into<String>,
    ) {
        let reason = reason.into();
        self.update(image_id, submission, |status| {
            status.state = JobState::Failed { stage };
            status.failure_reason = Some(reason);
        });
    }

    pub fn get(&self, image_id: &str) -> Option<JobStatus> {
        self.read().jobs.get(image_id).cloned()
    }

    /// Every known job, oldest first
    pub fn snapshot(&self) -> Vec<JobStatus> {
        let mut all: Vec<JobStatus> = self.read().jobs.values().cloned().collect();
        all.sort_by_key(|status| status.submission);
        all
    }

    fn update(&self, image_id: &str, submission: u64, apply: impl FnOnce(&mut JobStatus)) {
        let mut entries = self.write();
        match entries.jobs.get_mut(image_id) {
            Some(status) if status.submission == submission => {
                apply(status);
                status.updated_at = Utc::now();
            }
            Some(status) => debug!(
                image_id,
                submission,
                current = status.submission,
                "Ignoring update from a superseded submission"
            ),
            None => {}
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Entries> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Entries> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
