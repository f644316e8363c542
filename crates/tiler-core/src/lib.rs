//! # tiler-core
//!
//! Turns very large slide images held in an object store into Deep Zoom tile
//! pyramids and publishes them back to the store.
//!
//! A job downloads the source into a per-job working area, encodes the
//! pyramid, uploads every tile under `{image_id}/`, writes
//! `{image_id}/metadata.json` and removes the working area. Jobs are accepted
//! by the [`JobScheduler`] and run in the background; the
//! [`TilingOrchestrator`] can also be driven directly.

pub mod config;
pub mod encoder;
pub mod error;
pub mod job;
pub mod locks;
pub mod metadata;
pub mod orchestrator;
pub mod scheduler;
pub mod status;
pub mod working_area;

pub use error::{Error, Result, Stage};

// Re-export commonly used types
pub use config::{SchedulerConfig, ServiceConfig};
pub use encoder::{DeepZoomEncoder, EncodeOptions, PyramidEncoder, PyramidLayout};
pub use job::{StageTiming, TileUploadSummary, TilingJob, TimingsRecord};
pub use metadata::JobMetadataRecord;
pub use orchestrator::{
    JobFailure, JobOutcome, JobSummary, MetadataState, OrchestratorSettings, TilingOrchestrator,
};
pub use scheduler::{JobAck, JobScheduler, SubmitError};
pub use status::{JobState, JobStatus, StatusRegistry};
