//! Fire-and-forget job acceptance
//!
//! [`JobScheduler::submit`] validates a job, records it as pending and puts it
//! on a bounded queue, returning an acknowledgement straight away. A
//! dispatcher task pulls jobs off the queue and runs each one as its own
//! tokio task, with at most `max_concurrent_jobs` in flight.

use crate::config::SchedulerConfig;
use crate::error::Error;
use crate::job::TilingJob;
use crate::orchestrator::TilingOrchestrator;
use crate::status::{JobStatus, StatusRegistry};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Returned as soon as a job is queued
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobAck {
    pub message: String,
    pub job: TilingJob,
    pub accepted_at: DateTime<Utc>,
}

/// Why a job was not accepted
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error(transparent)]
    Invalid(#[from] Error),

    #[error("Job queue is full ({capacity} jobs waiting)")]
    QueueFull { capacity: usize },

    #[error("Scheduler is no longer accepting jobs")]
    Closed,
}

/// A queued job and the status entry it reports to
#[derive(Debug)]
struct Queued {
    job: TilingJob,
    submission: u64,
}

/// Accepts jobs and runs them in the background
#[derive(Debug)]
pub struct JobScheduler {
    sender: Mutex<Option<mpsc::Sender<Queued>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    status: StatusRegistry,
    cancel: CancellationToken,
    config: SchedulerConfig,
}

impl JobScheduler {
    /// Start the dispatcher. Must be called from within a tokio runtime.
    ///
    /// The orchestrator is wired to the scheduler's status registry.
    pub fn start(orchestrator: TilingOrchestrator, config: SchedulerConfig) -> Self {
        let status = StatusRegistry::new();
        let orchestrator = Arc::new(orchestrator.with_status(status.clone()));
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let cancel = CancellationToken::new();

        let dispatcher = tokio::spawn(dispatch(
            receiver,
            orchestrator,
            Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
            cancel.clone(),
        ));

        info!(
            max_concurrent_jobs = config.max_concurrent_jobs,
            queue_capacity = config.queue_capacity,
            "Job scheduler started"
        );

        Self {
            sender: Mutex::new(Some(sender)),
            dispatcher: Mutex::new(Some(dispatcher)),
            status,
            cancel,
            config,
        }
    }

    /// Queue a job without waiting for it to run
    pub fn submit(&self, job: TilingJob) -> Result<JobAck, SubmitError> {
        job.validate()?;

        let sender = self.sender.lock().unwrap_or_else(|p| p.into_inner());
        let sender = sender.as_ref().ok_or(SubmitError::Closed)?;

        // A rejected job leaves any earlier entry for the same id alone.
        let submission = self.status.admit(&job, |submission| {
            let queued = Queued {
                job: job.clone(),
                submission,
            };
            sender.try_send(queued).map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => SubmitError::QueueFull {
                    capacity: self.config.queue_capacity,
                },
                mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
            })
        })?;

        info!(image_id = %job.image_id, submission, "Accepted tiling job");
        Ok(JobAck {
            message: "Tiling job accepted and started in the background.".to_string(),
            job,
            accepted_at: Utc::now(),
        })
    }

    pub fn status(&self, image_id: &str) -> Option<JobStatus> {
        self.status.get(image_id)
    }

    /// Every job seen so far, oldest first
    pub fn statuses(&self) -> Vec<JobStatus> {
        self.status.snapshot()
    }

    pub fn registry(&self) -> &StatusRegistry {
        &self.status
    }

    /// Stop accepting jobs and wait until queued and running jobs finish
    pub async fn drain(&self) {
        self.sender
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();

        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!("Job dispatcher panicked: {}", err);
            }
        }
        info!("Job scheduler drained");
    }

    /// Like [`drain`](Self::drain), but running jobs stop at their next stage
    /// boundary and queued jobs fail before downloading
    pub async fn shutdown(&self) {
        info!("Shutting down job scheduler");
        self.cancel.cancel();
        self.drain().await;
    }
}

async fn dispatch(
    mut receiver: mpsc::Receiver<Queued>,
    orchestrator: Arc<TilingOrchestrator>,
    slots: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    let mut running = JoinSet::new();

    while let Some(Queued { job, submission }) = receiver.recv().await {
        let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
            break;
        };
        debug!(image_id = %job.image_id, "Dispatching tiling job");

        let orchestrator = Arc::clone(&orchestrator);
        let token = cancel.child_token();
        running.spawn(async move {
            let _permit = permit;
            orchestrator
                .process_submission(job, submission, token)
                .await;
        });

        while let Some(finished) = running.try_join_next() {
            if let Err(err) = finished {
                error!("Tiling task panicked: {}", err);
            }
        }
    }

    while let Some(finished) = running.join_next().await {
        if let Err(err) = finished {
            error!("Tiling task panicked: {}", err);
        }
    }
}
