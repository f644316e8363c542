//! Human-readable renderings of job statuses and metadata records

use tiler_core::status::{JobState, JobStatus};
use tiler_core::JobMetadataRecord;

pub fn print_status_table(statuses: &[JobStatus]) {
    println!(
        "{:<24} {:<12} {:<10} {}",
        "Image ID", "State", "Stage", "Detail"
    );
    println!("{}", "-".repeat(80));

    for status in statuses {
        let stage = match status.state {
            JobState::InProgress { stage } | JobState::Failed { stage } => stage.to_string(),
            JobState::Pending | JobState::Completed => "-".to_string(),
        };
        let detail = status
            .failure_reason
            .as_deref()
            .or(status.metadata_path.as_deref())
            .unwrap_or("-");

        println!(
            "{:<24} {:<12} {:<10} {}",
            status.image_id,
            status.state.label(),
            stage,
            detail
        );
    }
}

pub fn print_metadata(record: &JobMetadataRecord) {
    println!("Image ID:      {}", record.image_id);
    println!(
        "Dataset:       {}",
        record.dataset_name.as_deref().unwrap_or("-")
    );
    println!(
        "Source:        {}/{} ({} bytes, {})",
        record.source_bucket,
        record.source_object_name,
        record.source_size_bytes,
        record.source_content_type.as_deref().unwrap_or("unknown type")
    );
    println!(
        "Tiles:         {} files, {} bytes in {}/{}/",
        record.tile_file_count,
        record.tile_total_size_bytes,
        record.tile_upload_bucket,
        record.image_id
    );
    println!(
        "Timings:       download {:.3}s, tiling {:.3}s, upload {:.3}s, total {:.3}s",
        record.timings.download_seconds,
        record.timings.tiling_seconds,
        record.timings.upload_seconds,
        record.timings.total_seconds
    );
    println!(
        "Generated at:  {}",
        tiler_core::metadata::format_timestamp(&record.generated_at)
    );
}
