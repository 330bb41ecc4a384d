//! API integration tests for the tile surface and event push endpoint.
//!
//! Tests verify:
//! - Health reporting
//! - Pushed events drive the pipeline (canonical and storage notification bodies)
//! - Tile, DZI and thumbnail responses carry the right headers
//! - Error cases map to JSON errors with the right status codes

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use slide_pipeline::event::{Event, Uploaded};
use slide_pipeline::model::{Content, Image, ProcessingStatus};
use slide_pipeline::server::{AppState, EventIngest, REQUEST_KIND_HEADER};
use slide_pipeline::{create_router, RouterConfig};

use super::test_utils::{Pipeline, WorkerMode, DZI, TILE_A};

const IMAGE_ID: &str = "img-api";

fn router(pipeline: &Pipeline) -> Router {
    let state = AppState::new(pipeline.tile_server.clone()).with_ingest(EventIngest {
        serializer: pipeline.serializer.clone(),
        publisher: pipeline.publisher.clone(),
    });
    create_router(state, RouterConfig::new().with_tracing(false))
}

async fn get(router: &Router, uri: &str) -> axum::response::Response {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    router.clone().oneshot(request).await.unwrap()
}

async fn post(router: &Router, uri: &str, body: impl Into<Body>) -> axum::response::Response {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(body.into())
        .unwrap();
    router.clone().oneshot(request).await.unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

/// Push a canonical `uploaded` event and wait for the pipeline to finish.
async fn process_via_api(pipeline: &Pipeline, router: &Router) {
    let origin = pipeline.seed_upload(IMAGE_ID).await;
    let body = pipeline
        .serializer
        .serialize(&Event::new(Uploaded { content: origin }))
        .unwrap();

    let response = post(router, "/events/uploaded", body).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    pipeline.settle().await;
}

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let pipeline = Pipeline::start(WorkerMode::Succeed);
    let router = router(&pipeline);

    let response = get(&router, "/health").await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["status"], "healthy");
    assert!(json["version"].is_string());
    assert_eq!(json["cache"]["hits"], 0);

    pipeline.shutdown().await;
}

// =============================================================================
// Event Push
// =============================================================================

#[tokio::test]
async fn test_pushed_upload_is_accepted_and_processed() {
    let pipeline = Pipeline::start(WorkerMode::Succeed);
    let router = router(&pipeline);

    let origin = pipeline.seed_upload(IMAGE_ID).await;
    let event = Event::new(Uploaded { content: origin });
    let body = pipeline.serializer.serialize(&event).unwrap();

    let response = post(&router, "/events/uploaded", body).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = json_body(response).await;
    assert_eq!(json["event_id"], event.event_id());
    assert_eq!(json["kind"], "uploaded");

    pipeline.settle().await;
    let image = pipeline.store.images().read(IMAGE_ID).await.unwrap();
    assert_eq!(image.status(), ProcessingStatus::Processed);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_storage_notification_is_accepted() {
    let pipeline = Pipeline::start(WorkerMode::Succeed);
    let router = router(&pipeline);

    pipeline
        .store
        .images()
        .create(Image::with_id(IMAGE_ID, "notified.svs"))
        .await
        .unwrap();
    let mut origin = Content::new(IMAGE_ID, "gcs", "img-api/notified.svs", 2048);
    origin.id = "content-from-notification".to_string();
    pipeline.store.contents().create(origin).await.unwrap();

    let notification = serde_json::json!({
        "name": "img-api/notified.svs",
        "bucket": "slides",
        "contentType": "application/octet-stream",
        "size": "2048",
        "metadata": {
            "image-id": IMAGE_ID,
            "content-id": "content-from-notification"
        }
    });

    let response = post(&router, "/events/uploaded", notification.to_string()).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    pipeline.settle().await;
    assert_eq!(pipeline.worker.calls(), 1);
    let image = pipeline.store.images().read(IMAGE_ID).await.unwrap();
    assert_eq!(image.status(), ProcessingStatus::Processed);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_push_with_unknown_kind_is_rejected() {
    let pipeline = Pipeline::start(WorkerMode::Succeed);
    let router = router(&pipeline);

    let response = post(&router, "/events/reticulated", "{}").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "validation");

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_push_with_malformed_body_is_rejected() {
    let pipeline = Pipeline::start(WorkerMode::Succeed);
    let router = router(&pipeline);

    let response = post(&router, "/events/delete", "not json").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_push_route_requires_ingest() {
    let pipeline = Pipeline::start(WorkerMode::Succeed);
    let router = create_router(
        AppState::new(pipeline.tile_server.clone()),
        RouterConfig::new().with_tracing(false),
    );

    let response = post(&router, "/events/uploaded", "{}").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    pipeline.shutdown().await;
}

// =============================================================================
// Tile Surface
// =============================================================================

#[tokio::test]
async fn test_tile_response_headers() {
    let pipeline = Pipeline::start(WorkerMode::Succeed);
    let router = router(&pipeline);
    process_via_api(&pipeline, &router).await;

    let response = get(&router, "/images/img-api/12/0_0.jpeg").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("content-type").unwrap(), "image/jpeg");
    assert_eq!(
        response.headers().get("cache-control").unwrap(),
        "public, max-age=31536000, immutable"
    );
    assert_eq!(response.headers().get(REQUEST_KIND_HEADER).unwrap(), "tile");

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], TILE_A);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_dzi_response_headers() {
    let pipeline = Pipeline::start(WorkerMode::Succeed);
    let router = router(&pipeline);
    process_via_api(&pipeline, &router).await;

    let response = get(&router, "/images/img-api/slide.dzi").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/xml"
    );
    assert_eq!(
        response.headers().get("cache-control").unwrap(),
        "public, max-age=3600"
    );
    assert_eq!(response.headers().get(REQUEST_KIND_HEADER).unwrap(), "dzi");

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], DZI);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_repeated_requests_hit_the_cache() {
    let pipeline = Pipeline::start(WorkerMode::Succeed);
    let router = router(&pipeline);
    process_via_api(&pipeline, &router).await;

    for _ in 0..3 {
        let response = get(&router, "/images/img-api/12/0_0.jpeg").await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let health = json_body(get(&router, "/health").await).await;
    assert!(health["cache"]["hits"].as_u64().unwrap() > 0);

    pipeline.shutdown().await;
}

// =============================================================================
// Error Handling
// =============================================================================

#[tokio::test]
async fn test_unknown_image_returns_404_json() {
    let pipeline = Pipeline::start(WorkerMode::Succeed);
    let router = router(&pipeline);

    let response = get(&router, "/images/missing/slide.dzi").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let json = json_body(response).await;
    assert_eq!(json["error"], "not_found");
    assert_eq!(json["status"], 404);
    assert!(json["message"].as_str().unwrap().contains("missing"));

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_unclassifiable_path_returns_400() {
    let pipeline = Pipeline::start(WorkerMode::Succeed);
    let router = router(&pipeline);
    process_via_api(&pipeline, &router).await;

    let response = get(&router, "/images/img-api/readme").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "unknown_request_type");

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_missing_tile_returns_404() {
    let pipeline = Pipeline::start(WorkerMode::Succeed);
    let router = router(&pipeline);
    process_via_api(&pipeline, &router).await;

    let response = get(&router, "/images/img-api/12/7_7.jpeg").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["error"], "tile_not_found");

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_pending_image_has_no_tile_storage() {
    let pipeline = Pipeline::start(WorkerMode::Succeed);
    let router = router(&pipeline);
    pipeline
        .store
        .images()
        .create(Image::with_id(IMAGE_ID, "pending.svs"))
        .await
        .unwrap();

    let response = get(&router, "/images/img-api/12/0_0.jpeg").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["error"], "no_tile_storage");

    let response = get(&router, "/images/img-api/slide.dzi").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["error"], "artifact_not_found");

    pipeline.shutdown().await;
}
