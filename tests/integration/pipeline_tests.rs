//! End-to-end pipeline tests.
//!
//! Tests verify:
//! - An upload runs through processing until the image is `processed`
//! - Worker failures end in `failed_permanent` via the dead-letter event
//! - Redelivered artifact events leave the image unchanged
//! - Deleting an artifact invalidates what the tile server has cached

use futures::StreamExt;

use slide_pipeline::error::{PipelineError, TileError};
use slide_pipeline::event::{DeleteFile, Event, EventKind, NewFileExist, Payload, Uploaded};
use slide_pipeline::model::ProcessingStatus;
use slide_pipeline::storage::read_to_bytes;

use super::test_utils::{Pipeline, WorkerMode, PROCESS_ATTEMPTS, THUMBNAIL, TILE_A, TILE_B};

const IMAGE_ID: &str = "img-1";

async fn upload(pipeline: &Pipeline) {
    let origin = pipeline.seed_upload(IMAGE_ID).await;
    pipeline.publish(Event::new(Uploaded { content: origin })).await;
    pipeline.settle().await;
}

// =============================================================================
// Success Path
// =============================================================================

#[tokio::test]
async fn test_upload_is_processed_end_to_end() {
    let pipeline = Pipeline::start(WorkerMode::Succeed);
    upload(&pipeline).await;

    let image = pipeline.store.images().read(IMAGE_ID).await.unwrap();
    assert_eq!(image.status(), ProcessingStatus::Processed);
    assert_eq!(image.processing.version.as_deref(), Some("v2"));
    assert!(image.processing.failure_reason.is_none());
    assert!(image.thumbnail_content_id.is_some());
    assert!(image.dzi_content_id.is_some());
    assert!(image.indexmap_content_id.is_some());
    assert!(image.zip_tiles_content_id.is_some());
    assert!(image.tiles_content_id.is_none());

    assert_eq!(pipeline.worker.calls(), 1);
    assert_eq!(pipeline.published(EventKind::ImageProcessRequested).len(), 1);
    assert_eq!(pipeline.published(EventKind::NewFileExist).len(), 4);
    assert!(pipeline.published(EventKind::ImageProcessDlq).is_empty());

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_processed_image_serves_tiles_from_archive() {
    let pipeline = Pipeline::start(WorkerMode::Succeed);
    upload(&pipeline).await;

    for (path, expected) in [("12/0_0.jpeg", TILE_A), ("12/1_0.jpeg", TILE_B)] {
        let response = pipeline
            .tile_server
            .serve_request(IMAGE_ID, path)
            .await
            .unwrap();
        let body = read_to_bytes(response.body).await.unwrap();
        assert_eq!(&body[..], expected, "tile {path}");
    }

    // Both tiles came from ranged reads against the one archive
    assert_eq!(pipeline.storage.range_count(), 2);

    let missing = pipeline
        .tile_server
        .serve_request(IMAGE_ID, "12/9_9.jpeg")
        .await
        .unwrap_err();
    assert!(matches!(missing, TileError::TileNotFound { .. }));
    assert_eq!(pipeline.storage.range_count(), 2);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_non_slide_upload_is_not_processed() {
    let pipeline = Pipeline::start(WorkerMode::Succeed);
    pipeline.seed_upload(IMAGE_ID).await;
    let report = slide_pipeline::model::Content::new(IMAGE_ID, "s3", "img-1/report.pdf", 10);
    let report = pipeline.store.contents().create(report).await.unwrap();

    pipeline.publish(Event::new(Uploaded { content: report })).await;
    pipeline.settle().await;

    assert_eq!(pipeline.worker.calls(), 0);
    let image = pipeline.store.images().read(IMAGE_ID).await.unwrap();
    assert_eq!(image.status(), ProcessingStatus::Pending);

    pipeline.shutdown().await;
}

// =============================================================================
// Failure Path
// =============================================================================

#[tokio::test]
async fn test_unavailable_worker_dead_letters_after_retries() {
    let pipeline = Pipeline::start(WorkerMode::Unavailable);
    upload(&pipeline).await;

    assert_eq!(pipeline.worker.calls(), PROCESS_ATTEMPTS as usize);

    let dlq = pipeline.published(EventKind::ImageProcessDlq);
    assert_eq!(dlq.len(), 1);
    let Payload::ImageProcessDlq(payload) = dlq[0].payload() else {
        panic!("expected dlq payload");
    };
    assert_eq!(payload.image_id, IMAGE_ID);
    assert_eq!(payload.retry.attempt_count, PROCESS_ATTEMPTS);
    assert!(payload.retryable);

    let image = pipeline.store.images().read(IMAGE_ID).await.unwrap();
    assert_eq!(image.status(), ProcessingStatus::FailedPermanent);
    assert_eq!(image.processing.retry_count, PROCESS_ATTEMPTS);
    assert!(image.processing.failure_reason.is_some());

    // Terminal: nothing asked the worker to try again
    assert_eq!(pipeline.published(EventKind::ImageProcessRequested).len(), 1);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_reported_failure_goes_straight_to_dlq() {
    let pipeline = Pipeline::start(WorkerMode::ReportFailure);
    upload(&pipeline).await;

    assert_eq!(pipeline.worker.calls(), 1);
    assert!(pipeline.published(EventKind::NewFileExist).is_empty());

    let image = pipeline.store.images().read(IMAGE_ID).await.unwrap();
    assert_eq!(image.status(), ProcessingStatus::FailedPermanent);
    assert_eq!(
        image.processing.failure_reason.as_deref(),
        Some("corrupt slide")
    );
    assert_eq!(image.processing.retry_count, 1);

    pipeline.shutdown().await;
}

// =============================================================================
// Redelivery and Deletion
// =============================================================================

#[tokio::test]
async fn test_redelivered_artifact_is_idempotent() {
    let pipeline = Pipeline::start(WorkerMode::Succeed);
    upload(&pipeline).await;

    let before = pipeline.store.images().read(IMAGE_ID).await.unwrap();
    let thumbnail = pipeline
        .store
        .contents()
        .read(before.thumbnail_content_id.as_deref().unwrap())
        .await
        .unwrap();

    pipeline
        .publish(Event::new(NewFileExist { content: thumbnail }))
        .await;
    pipeline.settle().await;

    let after = pipeline.store.images().read(IMAGE_ID).await.unwrap();
    assert_eq!(after.status(), ProcessingStatus::Processed);
    assert_eq!(after.thumbnail_content_id, before.thumbnail_content_id);
    assert_eq!(after.zip_tiles_content_id, before.zip_tiles_content_id);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_deleted_artifact_is_no_longer_served() {
    let pipeline = Pipeline::start(WorkerMode::Succeed);
    upload(&pipeline).await;

    // Warm the cache with the thumbnail's metadata
    let response = pipeline
        .tile_server
        .serve_request(IMAGE_ID, "thumbnail.jpg")
        .await
        .unwrap();
    let chunks: Vec<_> = response.body.collect().await;
    let body: Vec<u8> = chunks
        .into_iter()
        .flat_map(|chunk| chunk.unwrap().to_vec())
        .collect();
    assert_eq!(body, THUMBNAIL);

    let image = pipeline.store.images().read(IMAGE_ID).await.unwrap();
    let thumbnail_id = image.thumbnail_content_id.clone().unwrap();
    pipeline
        .publish(Event::new(DeleteFile {
            content_id: thumbnail_id.clone(),
            path: None,
        }))
        .await;
    pipeline.settle().await;

    assert!(matches!(
        pipeline.store.contents().read(&thumbnail_id).await,
        Err(PipelineError::ContentNotFound(_))
    ));
    assert!(matches!(
        pipeline
            .tile_server
            .serve_request(IMAGE_ID, "thumbnail.jpg")
            .await,
        Err(TileError::ArtifactNotFound { .. })
    ));

    pipeline.shutdown().await;
}
