//! The `metadata.json` record written next to each tile set

use crate::job::{StageTiming, TileUploadSummary, TilingJob, TimingsRecord};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tiler_store::ObjectInfo;

/// File name of the record inside the `{image_id}/` prefix
pub const METADATA_FILE_NAME: &str = "metadata.json";

/// Destination key of the metadata record for `image_id`
pub fn metadata_key(image_id: &str) -> String {
    format!("{image_id}/{METADATA_FILE_NAME}")
}

/// Persisted summary of one completed tiling job.
///
/// Written once per run; a re-run of the same `image_id` replaces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetadataRecord {
    pub image_id: String,
    pub dataset_name: Option<String>,
    pub source_bucket: String,
    pub source_object_name: String,
    pub source_size_bytes: u64,
    pub source_content_type: Option<String>,
    pub tile_upload_bucket: String,
    pub tile_file_count: u64,
    pub tile_total_size_bytes: u64,
    pub timings: TimingsRecord,
    #[serde(with = "utc_iso8601")]
    pub generated_at: DateTime<Utc>,
}

impl JobMetadataRecord {
    pub fn new(
        job: &TilingJob,
        source: &ObjectInfo,
        upload_bucket: &str,
        uploaded: TileUploadSummary,
        timing: StageTiming,
        generated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            image_id: job.image_id.clone(),
            dataset_name: job.dataset_name.clone(),
            source_bucket: job.source_bucket.clone(),
            source_object_name: job.source_object_name.clone(),
            source_size_bytes: source.size,
            source_content_type: source.content_type.clone(),
            tile_upload_bucket: upload_bucket.to_string(),
            tile_file_count: uploaded.file_count,
            tile_total_size_bytes: uploaded.total_bytes,
            timings: timing.rounded(),
            generated_at,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

mod utc_iso8601 {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &DateTime<Utc>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// `generated_at` as written to the record
pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, false)
}
