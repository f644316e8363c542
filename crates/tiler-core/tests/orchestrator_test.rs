//! End-to-end tests of the tiling pipeline against an in-memory store

use std::path::PathBuf;
use std::sync::Arc;
use tiler_core::encoder::DziDescriptor;
use tiler_core::{
    DeepZoomEncoder, EncodeOptions, Error, JobMetadataRecord, JobOutcome, MetadataState,
    OrchestratorSettings, Stage, TilingJob, TilingOrchestrator,
};
use tiler_store::{BucketStore, ObjectStoreClient};
use tiler_testing::assertions::{assert_dir_empty_or_missing, assert_keys_under_prefix, object_keys};
use tiler_testing::faults::{InstrumentedStore, StoreOp};
use tiler_testing::fixtures::seed_slide;
use tiler_testing::TestDir;
use tokio_util::sync::CancellationToken;

const UPLOAD_BUCKET: &str = "histoflow-tiles";

struct Harness {
    dir: TestDir,
    backing: Arc<dyn ObjectStoreClient>,
    store: InstrumentedStore,
    orchestrator: TilingOrchestrator,
}

impl Harness {
    fn new() -> Self {
        let dir = TestDir::new().unwrap();
        let backing: Arc<dyn ObjectStoreClient> = Arc::new(BucketStore::memory());
        let store = InstrumentedStore::new(Arc::clone(&backing));
        let settings = OrchestratorSettings {
            temp_root: dir.join("work"),
            upload_bucket: UPLOAD_BUCKET.to_string(),
            encode: EncodeOptions::default(),
        };
        let orchestrator = TilingOrchestrator::new(
            Arc::new(store.clone()),
            Arc::new(DeepZoomEncoder::new()),
            settings,
        );
        Self {
            dir,
            backing,
            store,
            orchestrator,
        }
    }

    async fn seed(&self, key: &str, width: u32, height: u32) -> u64 {
        seed_slide(self.backing.as_ref(), &self.dir, "raw", key, width, height)
            .await
            .unwrap()
    }

    fn work_dir(&self, image_id: &str) -> PathBuf {
        self.dir.join("work").join(image_id)
    }

    async fn keys(&self, prefix: &str) -> Vec<String> {
        object_keys(self.backing.as_ref(), UPLOAD_BUCKET, prefix)
            .await
            .unwrap()
    }

    async fn metadata(&self, image_id: &str) -> JobMetadataRecord {
        let body = self
            .backing
            .read_object(UPLOAD_BUCKET, &format!("{image_id}/metadata.json"))
            .await
            .unwrap();
        JobMetadataRecord::from_json(&body).unwrap()
    }
}

fn expect_failure(outcome: JobOutcome) -> (Stage, Error) {
    match outcome {
        JobOutcome::Failed(failure) => (failure.stage, failure.error),
        JobOutcome::Completed(summary) => panic!("job {} unexpectedly completed", summary.image_id),
    }
}

#[tokio::test]
async fn test_slide_is_tiled_and_published() {
    let harness = Harness::new();
    let source_size = harness.seed("unprocessed/slide-001/a.tiff", 600, 400).await;

    let job = TilingJob::new("slide-001", "raw", "unprocessed/slide-001/a.tiff")
        .with_dataset("camelyon");
    let outcome = harness.orchestrator.process_image(job).await;

    let summary = match outcome {
        JobOutcome::Completed(summary) => summary,
        JobOutcome::Failed(failure) => panic!("job failed: {:?}", failure),
    };
    // 600x400 -> levels 0..=10; 6 + 2 + 9 single-tile levels, plus the descriptor
    assert_eq!(summary.levels, 11);
    assert_eq!(summary.uploaded.file_count, 18);
    assert_eq!(summary.source.size, source_size);
    assert!(matches!(summary.metadata, MetadataState::Written { .. }));

    let keys = harness.keys("slide-001").await;
    assert_keys_under_prefix(&keys, "slide-001");
    assert!(keys.contains(&"slide-001/image.dzi".to_string()));
    assert!(keys.contains(&"slide-001/image_files/10/2_1.jpg".to_string()));
    assert!(keys.contains(&"slide-001/image_files/9/1_0.jpg".to_string()));
    assert!(keys.contains(&"slide-001/image_files/0/0_0.jpg".to_string()));
    assert!(keys.contains(&"slide-001/metadata.json".to_string()));

    let dzi = harness
        .backing
        .read_object(UPLOAD_BUCKET, "slide-001/image.dzi")
        .await
        .unwrap();
    let descriptor = DziDescriptor::parse(std::str::from_utf8(&dzi).unwrap()).unwrap();
    assert_eq!((descriptor.width, descriptor.height), (600, 400));
    assert_eq!(descriptor.tile_size, 256);
    assert_eq!(descriptor.overlap, 0);

    let tile = harness
        .backing
        .read_object(UPLOAD_BUCKET, "slide-001/image_files/10/0_0.jpg")
        .await
        .unwrap();
    let tile = image::load_from_memory(&tile).unwrap();
    assert_eq!((tile.width(), tile.height()), (256, 256));

    let record = harness.metadata("slide-001").await;
    assert_eq!(record.image_id, "slide-001");
    assert_eq!(record.dataset_name.as_deref(), Some("camelyon"));
    assert_eq!(record.source_bucket, "raw");
    assert_eq!(record.source_object_name, "unprocessed/slide-001/a.tiff");
    assert_eq!(record.source_size_bytes, source_size);
    assert_eq!(record.source_content_type.as_deref(), Some("image/tiff"));
    assert_eq!(record.tile_upload_bucket, UPLOAD_BUCKET);
    assert_eq!(record.timings, summary.timings);

    assert_dir_empty_or_missing(&harness.work_dir("slide-001")).unwrap();
}

#[tokio::test]
async fn test_metadata_counts_match_published_objects() {
    let harness = Harness::new();
    harness.seed("unprocessed/slide-002/b.png", 300, 300).await;

    let outcome = harness
        .orchestrator
        .process_image(TilingJob::new("slide-002", "raw", "unprocessed/slide-002/b.png"))
        .await;
    assert!(outcome.is_completed());

    let listing = harness
        .backing
        .list_objects(UPLOAD_BUCKET, "slide-002")
        .await
        .unwrap();
    let tiles: Vec<_> = listing
        .iter()
        .filter(|entry| !entry.key.ends_with("/metadata.json"))
        .collect();

    let record = harness.metadata("slide-002").await;
    assert_eq!(record.tile_file_count, tiles.len() as u64);
    assert_eq!(
        record.tile_total_size_bytes,
        tiles.iter().map(|entry| entry.size).sum::<u64>()
    );

    let timings = record.timings;
    let sum = timings.download_seconds + timings.tiling_seconds + timings.upload_seconds;
    assert!((timings.total_seconds - sum).abs() < 0.0015);
}

#[tokio::test]
async fn test_missing_source_uploads_nothing() {
    let harness = Harness::new();
    harness.backing.create_bucket("raw").await.unwrap();

    let outcome = harness
        .orchestrator
        .process_image(TilingJob::new("slide-404", "raw", "unprocessed/slide-404/a.tiff"))
        .await;

    let (stage, error) = expect_failure(outcome);
    assert_eq!(stage, Stage::Download);
    assert!(matches!(error, Error::SourceNotFound { .. }));
    assert_eq!(harness.store.calls(StoreOp::UploadFile), 0);
    assert_eq!(harness.store.calls(StoreOp::UploadBytes), 0);
    assert!(!harness.backing.bucket_exists(UPLOAD_BUCKET).await.unwrap());
    assert_dir_empty_or_missing(&harness.work_dir("slide-404")).unwrap();
}

#[tokio::test]
async fn test_missing_source_bucket_is_source_not_found() {
    let harness = Harness::new();

    let outcome = harness
        .orchestrator
        .process_image(TilingJob::new("slide-405", "nowhere", "a.tiff"))
        .await;

    let (stage, error) = expect_failure(outcome);
    assert_eq!(stage, Stage::Download);
    assert!(matches!(error, Error::SourceNotFound { .. }));
}

#[tokio::test]
async fn test_unreachable_store_is_store_unavailable() {
    let harness = Harness::new();
    harness.seed("unprocessed/slide-003/a.png", 64, 64).await;
    harness.store.fail(StoreOp::Stat);

    let outcome = harness
        .orchestrator
        .process_image(TilingJob::new("slide-003", "raw", "unprocessed/slide-003/a.png"))
        .await;

    let (stage, error) = expect_failure(outcome);
    assert_eq!(stage, Stage::Download);
    assert!(matches!(error, Error::StoreUnavailable(_)));
    assert_eq!(harness.store.calls(StoreOp::Download), 0);
}

#[tokio::test]
async fn test_undecodable_source_fails_in_tiling() {
    let harness = Harness::new();
    let garbage = harness.dir.create_file("garbage.tiff", b"definitely not a tiff").unwrap();
    harness.backing.create_bucket("raw").await.unwrap();
    harness
        .backing
        .upload_file("raw", "unprocessed/slide-004/garbage.tiff", &garbage)
        .await
        .unwrap();

    let outcome = harness
        .orchestrator
        .process_image(TilingJob::new(
            "slide-004",
            "raw",
            "unprocessed/slide-004/garbage.tiff",
        ))
        .await;

    let (stage, error) = expect_failure(outcome);
    assert_eq!(stage, Stage::Tiling);
    assert!(matches!(error, Error::Encoding(_)));
    assert_eq!(harness.store.calls(StoreOp::UploadFile), 0);
    assert_dir_empty_or_missing(&harness.work_dir("slide-004")).unwrap();
}

#[tokio::test]
async fn test_upload_failure_aborts_without_metadata() {
    let harness = Harness::new();
    harness.seed("unprocessed/slide-005/a.png", 64, 64).await;
    harness.store.fail_uploads_after(3);

    let outcome = harness
        .orchestrator
        .process_image(TilingJob::new("slide-005", "raw", "unprocessed/slide-005/a.png"))
        .await;

    let (stage, error) = expect_failure(outcome);
    assert_eq!(stage, Stage::Upload);
    assert!(matches!(error, Error::Upload { .. }));
    assert_eq!(harness.store.calls(StoreOp::UploadBytes), 0);
    assert_dir_empty_or_missing(&harness.work_dir("slide-005")).unwrap();
}

#[tokio::test]
async fn test_metadata_failure_still_completes() {
    let harness = Harness::new();
    harness.seed("unprocessed/slide-006/a.png", 64, 64).await;
    harness.store.fail_keys_ending_with("metadata.json");

    let outcome = harness
        .orchestrator
        .process_image(TilingJob::new("slide-006", "raw", "unprocessed/slide-006/a.png"))
        .await;

    let summary = match outcome {
        JobOutcome::Completed(summary) => summary,
        JobOutcome::Failed(failure) => panic!("job failed: {:?}", failure),
    };
    assert!(matches!(summary.metadata, MetadataState::Failed(_)));

    let keys = harness.keys("slide-006").await;
    assert!(keys.contains(&"slide-006/image.dzi".to_string()));
    assert!(!keys.contains(&"slide-006/metadata.json".to_string()));
    assert_dir_empty_or_missing(&harness.work_dir("slide-006")).unwrap();
}

#[tokio::test]
async fn test_destination_bucket_created_once() {
    let harness = Harness::new();
    harness.seed("unprocessed/slide-007/a.png", 64, 64).await;
    harness.seed("unprocessed/slide-008/a.png", 64, 64).await;

    for id in ["slide-007", "slide-008"] {
        let job = TilingJob::new(id, "raw", format!("unprocessed/{id}/a.png"));
        assert!(harness.orchestrator.process_image(job).await.is_completed());
    }

    assert_eq!(harness.store.calls(StoreOp::CreateBucket), 1);
    assert_keys_under_prefix(&harness.keys("slide-007").await, "slide-007");
    assert_keys_under_prefix(&harness.keys("slide-008").await, "slide-008");
}

#[tokio::test]
async fn test_rerun_overwrites_tile_set() {
    let harness = Harness::new();
    harness.seed("unprocessed/slide-009/a.png", 300, 200).await;
    let job = TilingJob::new("slide-009", "raw", "unprocessed/slide-009/a.png");

    assert!(harness.orchestrator.process_image(job.clone()).await.is_completed());
    let first_keys = harness.keys("slide-009").await;
    let first = harness.metadata("slide-009").await;

    assert!(harness.orchestrator.process_image(job).await.is_completed());
    let second_keys = harness.keys("slide-009").await;
    let second = harness.metadata("slide-009").await;

    assert_eq!(first_keys, second_keys);
    assert_eq!(first.tile_file_count, second.tile_file_count);
    assert_eq!(first.tile_total_size_bytes, second.tile_total_size_bytes);
    assert!(second.generated_at >= first.generated_at);
    assert_eq!(harness.store.calls(StoreOp::UploadBytes), 2);
}

#[tokio::test]
async fn test_distinct_jobs_run_concurrently() {
    let harness = Harness::new();
    harness.seed("unprocessed/slide-010/a.png", 128, 128).await;
    harness.seed("unprocessed/slide-011/a.png", 128, 128).await;

    let (a, b) = tokio::join!(
        harness
            .orchestrator
            .process_image(TilingJob::new("slide-010", "raw", "unprocessed/slide-010/a.png")),
        harness
            .orchestrator
            .process_image(TilingJob::new("slide-011", "raw", "unprocessed/slide-011/a.png")),
    );

    assert!(a.is_completed());
    assert!(b.is_completed());
    assert_eq!(harness.metadata("slide-010").await.image_id, "slide-010");
    assert_eq!(harness.metadata("slide-011").await.image_id, "slide-011");
}

#[tokio::test]
async fn test_cancelled_job_stops_before_download() {
    let harness = Harness::new();
    harness.seed("unprocessed/slide-012/a.png", 64, 64).await;

    let token = CancellationToken::new();
    token.cancel();
    let outcome = harness
        .orchestrator
        .process_image_with_cancel(
            TilingJob::new("slide-012", "raw", "unprocessed/slide-012/a.png"),
            token,
        )
        .await;

    let (stage, error) = expect_failure(outcome);
    assert_eq!(stage, Stage::Download);
    assert!(matches!(
        error,
        Error::Cancelled {
            stage: Stage::Download
        }
    ));
    assert_eq!(harness.store.calls(StoreOp::Stat), 0);
    assert_dir_empty_or_missing(&harness.work_dir("slide-012")).unwrap();
}

#[tokio::test]
async fn test_invalid_job_is_rejected() {
    let harness = Harness::new();

    let outcome = harness
        .orchestrator
        .process_image(TilingJob::new("../escape", "raw", "a.tiff"))
        .await;

    let (_, error) = expect_failure(outcome);
    assert!(matches!(error, Error::InvalidJob(_)));
    assert_eq!(harness.store.calls(StoreOp::Stat), 0);
}

#[tokio::test]
async fn test_cancel_after_upload_keeps_job_completed() {
    let harness = Harness::new();
    harness.seed("unprocessed/slide-013/a.png", 300, 200).await;

    let token = CancellationToken::new();
    let trigger = token.clone();
    harness.store.on_upload(move || trigger.cancel());

    let outcome = harness
        .orchestrator
        .process_image_with_cancel(
            TilingJob::new("slide-013", "raw", "unprocessed/slide-013/a.png"),
            token,
        )
        .await;

    let summary = match outcome {
        JobOutcome::Completed(summary) => summary,
        JobOutcome::Failed(failure) => panic!("job failed: {:?}", failure),
    };
    assert!(matches!(summary.metadata, MetadataState::Written { .. }));
    assert_eq!(
        harness.metadata("slide-013").await.tile_file_count,
        summary.uploaded.file_count
    );
    assert_dir_empty_or_missing(&harness.work_dir("slide-013")).unwrap();
}

#[tokio::test]
async fn test_source_named_like_image_id() {
    let harness = Harness::new();
    harness.seed("unprocessed/slide-014/a.png", 128, 96).await;

    let outcome = harness
        .orchestrator
        .process_image(TilingJob::new("a.png", "raw", "unprocessed/slide-014/a.png"))
        .await;

    assert!(outcome.is_completed(), "{outcome:?}");
    let keys = harness.keys("a.png").await;
    assert_keys_under_prefix(&keys, "a.png");
    assert!(keys.contains(&"a.png/image.dzi".to_string()));
    assert!(keys.contains(&"a.png/metadata.json".to_string()));
    assert_dir_empty_or_missing(&harness.work_dir("a.png")).unwrap();
}

#[tokio::test]
async fn test_lost_bucket_creation_race_is_not_fatal() {
    let harness = Harness::new();
    harness.seed("unprocessed/slide-015/a.png", 64, 64).await;
    harness.store.lose_create_bucket_race();

    let outcome = harness
        .orchestrator
        .process_image(TilingJob::new("slide-015", "raw", "unprocessed/slide-015/a.png"))
        .await;

    assert!(outcome.is_completed(), "{outcome:?}");
    assert_eq!(harness.store.calls(StoreOp::CreateBucket), 1);
    assert_eq!(harness.store.calls(StoreOp::BucketExists), 2);
    assert!(harness
        .keys("slide-015")
        .await
        .contains(&"slide-015/metadata.json".to_string()));
}

#[tokio::test]
async fn test_same_image_runs_are_serialized() {
    let harness = Harness::new();
    harness.seed("unprocessed/slide-016/a.png", 300, 200).await;
    let job = TilingJob::new("slide-016", "raw", "unprocessed/slide-016/a.png");

    let (first, second) = tokio::join!(
        harness.orchestrator.process_image(job.clone()),
        harness.orchestrator.process_image(job),
    );

    let first = match first {
        JobOutcome::Completed(summary) => summary,
        JobOutcome::Failed(failure) => panic!("first run failed: {:?}", failure),
    };
    let second = match second {
        JobOutcome::Completed(summary) => summary,
        JobOutcome::Failed(failure) => panic!("second run failed: {:?}", failure),
    };
    assert_eq!(first.uploaded, second.uploaded);
    assert_eq!(harness.store.calls(StoreOp::UploadBytes), 2);

    let keys = harness.keys("slide-016").await;
    let record = harness.metadata("slide-016").await;
    assert_eq!(record.tile_file_count as usize, keys.len() - 1);
    assert_dir_empty_or_missing(&harness.work_dir("slide-016")).unwrap();
}
