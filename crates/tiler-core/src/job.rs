//! Job description and per-job measurements

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// One request to tile a slide.
///
/// Field names follow the job request schema (`image_id`, `source_bucket`,
/// `source_object_name`, `dataset_name`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TilingJob {
    /// Tile-set prefix and local working directory name
    pub image_id: String,
    /// Bucket holding the original slide
    pub source_bucket: String,
    /// Key of the original slide, e.g. `unprocessed/slide-001/a.tiff`
    pub source_object_name: String,
    /// Free-form label copied into the metadata record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_name: Option<String>,
}

impl TilingJob {
    pub fn new(
        image_id: impl Into<String>,
        source_bucket: impl Into<String>,
        source_object_name: impl Into<String>,
    ) -> Self {
        Self {
            image_id: image_id.into(),
            source_bucket: source_bucket.into(),
            source_object_name: source_object_name.into(),
            dataset_name: None,
        }
    }

    pub fn with_dataset(mut self, dataset_name: impl Into<String>) -> Self {
        self.dataset_name = Some(dataset_name.into());
        self
    }

    /// Minimal validation performed at acceptance time.
    ///
    /// `image_id` becomes both a directory name and a key prefix, so it must
    /// be a single path segment.
    pub fn validate(&self) -> Result<()> {
        let id = self.image_id.as_str();
        if id.trim().is_empty() {
            return Err(Error::InvalidJob("image_id must not be empty".into()));
        }
        if id == "." || id == ".." || id.contains(['/', '\\', '\0']) {
            return Err(Error::InvalidJob(format!(
                "image_id '{id}' must be a single path segment"
            )));
        }
        if self.source_bucket.trim().is_empty() {
            return Err(Error::InvalidJob("source_bucket must not be empty".into()));
        }
        if self.source_file_name().is_none() {
            return Err(Error::InvalidJob(format!(
                "source_object_name '{}' has no file name",
                self.source_object_name
            )));
        }
        Ok(())
    }

    /// Last segment of the source key, used as the local download name
    pub fn source_file_name(&self) -> Option<&str> {
        self.source_object_name
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty() && *name != "." && *name != "..")
    }
}

/// Wall-clock duration of each stage, in seconds
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StageTiming {
    pub download: f64,
    pub tiling: f64,
    pub upload: f64,
}

impl StageTiming {
    pub fn total(&self) -> f64 {
        self.download + self.tiling + self.upload
    }

    /// Millisecond-rounded values as persisted in `metadata.json`.
    ///
    /// The total is the sum of the rounded parts so the record is always
    /// self-consistent.
    pub fn rounded(&self) -> TimingsRecord {
        let download_seconds = round_millis(self.download);
        let tiling_seconds = round_millis(self.tiling);
        let upload_seconds = round_millis(self.upload);
        TimingsRecord {
            download_seconds,
            tiling_seconds,
            upload_seconds,
            total_seconds: round_millis(download_seconds + tiling_seconds + upload_seconds),
        }
    }
}

/// The `timings` object of the metadata record
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingsRecord {
    pub download_seconds: f64,
    pub tiling_seconds: f64,
    pub upload_seconds: f64,
    pub total_seconds: f64,
}

fn round_millis(seconds: f64) -> f64 {
    (seconds * 1000.0).round() / 1000.0
}

/// Files and bytes pushed during the upload stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileUploadSummary {
    pub file_count: u64,
    pub total_bytes: u64,
}

impl TileUploadSummary {
    pub(crate) fn record(&mut self, bytes: u64) {
        self.file_count += 1;
        self.total_bytes += bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_job() {
        let job = TilingJob::new("slide-001", "raw", "unprocessed/slide-001/a.tiff")
            .with_dataset("camelyon");
        assert!(job.validate().is_ok());
        assert_eq!(job.source_file_name(), Some("a.tiff"));
        assert_eq!(job.dataset_name.as_deref(), Some("camelyon"));
    }

    #[test]
    fn test_rejects_unsafe_image_ids() {
        for id in ["", "  ", ".", "..", "a/b", "a\\b"] {
            let job = TilingJob::new(id, "raw", "a.tiff");
            assert!(job.validate().is_err(), "accepted image_id {id:?}");
        }
    }

    #[test]
    fn test_rejects_source_without_file_name() {
        let job = TilingJob::new("slide-001", "raw", "unprocessed/slide-001/");
        assert!(matches!(job.validate(), Err(Error::InvalidJob(_))));

        let job = TilingJob::new("slide-001", "", "a.tiff");
        assert!(job.validate().is_err());
    }

    #[test]
    fn test_job_json_schema() {
        let job: TilingJob = serde_json::from_str(
            r#"{"image_id":"slide-001","source_bucket":"raw","source_object_name":"a.tiff"}"#,
        )
        .unwrap();
        assert_eq!(job.image_id, "slide-001");
        assert_eq!(job.dataset_name, None);
    }

    #[test]
    fn test_rounded_total_is_sum_of_parts() {
        let timing = StageTiming {
            download: 1.23449,
            tiling: 10.00051,
            upload: 2.9996,
        };
        let record = timing.rounded();
        assert_eq!(record.download_seconds, 1.234);
        assert_eq!(record.tiling_seconds, 10.001);
        assert_eq!(record.upload_seconds, 3.0);
        let sum = record.download_seconds + record.tiling_seconds + record.upload_seconds;
        assert!((record.total_seconds - sum).abs() < 1e-9);
        assert!((timing.total() - 14.23460).abs() < 1e-9);
    }

    #[test]
    fn test_upload_summary_accumulates() {
        let mut summary = TileUploadSummary::default();
        summary.record(100);
        summary.record(23);
        assert_eq!(summary.file_count, 2);
        assert_eq!(summary.total_bytes, 123);
    }
}
