//! HTTP request handlers for the tile surface.
//!
//! # Endpoints
//!
//! - `GET /images/{image_id}/{*object_path}` - Serve a DZI, thumbnail, index map or tile
//! - `POST /events/{kind}` - Push an event into the pipeline
//! - `GET /health` - Health check endpoint

use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::cache::CacheStats;
use crate::error::{ErrorKind, IoError, PipelineError, TileError};
use crate::event::EventSerializer;
use crate::messaging::Publisher;
use crate::tile::TileServer;

/// Response header carrying the request classification
pub const REQUEST_KIND_HEADER: HeaderName = HeaderName::from_static("x-request-kind");

// =============================================================================
// Application State
// =============================================================================

/// Shared application state, passed to handlers via Axum's State extractor.
#[derive(Clone)]
pub struct AppState {
    pub tile_server: Arc<TileServer>,

    /// Event push endpoint; the route is only mounted when set
    pub ingest: Option<EventIngest>,
}

impl AppState {
    pub fn new(tile_server: Arc<TileServer>) -> Self {
        Self {
            tile_server,
            ingest: None,
        }
    }

    pub fn with_ingest(mut self, ingest: EventIngest) -> Self {
        self.ingest = Some(ingest);
        self
    }
}

/// Decodes pushed messages and republishes them onto the transport.
#[derive(Clone)]
pub struct EventIngest {
    pub serializer: Arc<dyn EventSerializer>,
    pub publisher: Arc<dyn Publisher>,
}

// =============================================================================
// Request Parameters
// =============================================================================

/// Path parameters for `/images/{image_id}/{*object_path}`.
#[derive(Debug, Deserialize)]
pub struct ImagePathParams {
    pub image_id: String,

    /// Everything after the image id, e.g. `slide.dzi` or `slide_files/12/3_4.jpeg`
    pub object_path: String,
}

// =============================================================================
// Response Types
// =============================================================================

/// JSON error response returned for all error conditions.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error type identifier (e.g., "not_found", "unknown_request_type")
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// HTTP status code (included for convenience)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ErrorResponse {
    pub fn with_status(
        error: impl Into<String>,
        message: impl Into<String>,
        status: StatusCode,
    ) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: Some(status.as_u16()),
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub cache: CacheStatsResponse,
}

/// Response for an accepted event.
#[derive(Debug, Serialize)]
pub struct EventAcceptedResponse {
    pub event_id: String,
    pub kind: String,
}

#[derive(Debug, Serialize)]
pub struct CacheStatsResponse {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: u64,
}

impl From<CacheStats> for CacheStatsResponse {
    fn from(stats: CacheStats) -> Self {
        Self {
            hits: stats.hits,
            misses: stats.misses,
            evictions: stats.evictions,
            size: stats.size,
        }
    }
}

// =============================================================================
// Error Mapping
// =============================================================================

fn status_for_kind(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Convert TileError to HTTP response.
///
/// 5xx errors are logged at ERROR, 404s at DEBUG and other 4xx at WARN.
impl IntoResponse for TileError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        let (status, error_type) = match &self {
            TileError::UnknownRequestType(_) => {
                (StatusCode::BAD_REQUEST, "unknown_request_type")
            }
            TileError::ImageNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            TileError::ArtifactNotFound { .. } => (StatusCode::NOT_FOUND, "artifact_not_found"),
            TileError::TileNotFound { .. } => (StatusCode::NOT_FOUND, "tile_not_found"),
            TileError::NoTileStorageConfigured(_) => {
                (StatusCode::NOT_FOUND, "no_tile_storage")
            }
            TileError::Repository(e) => (status_for_kind(e.kind()), "repository_error"),
            TileError::Io(io_err) => match io_err {
                IoError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                IoError::Connection(_) => (StatusCode::BAD_GATEWAY, "connection_error"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
            },
        };

        if status.is_server_error() {
            error!(
                error_type = error_type,
                status = status.as_u16(),
                "Server error: {}",
                message
            );
        } else if status == StatusCode::NOT_FOUND {
            debug!(
                error_type = error_type,
                status = status.as_u16(),
                "Resource not found: {}",
                message
            );
        } else {
            warn!(
                error_type = error_type,
                status = status.as_u16(),
                "Client error: {}",
                message
            );
        }

        let error_response = ErrorResponse::with_status(error_type, message, status);
        (status, Json(error_response)).into_response()
    }
}

/// Convert PipelineError to HTTP response, by error kind.
impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status = status_for_kind(kind);
        let message = self.to_string();

        if status.is_server_error() {
            error!(error_type = %kind, status = status.as_u16(), "Server error: {}", message);
        } else {
            warn!(error_type = %kind, status = status.as_u16(), "Client error: {}", message);
        }

        let error_response = ErrorResponse::with_status(kind.to_string(), message, status);
        (status, Json(error_response)).into_response()
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Handle object requests below an image.
///
/// # Endpoint
///
/// `GET /images/{image_id}/{*object_path}`
///
/// # Response
///
/// `200 OK` streaming the object, with `Content-Type`, `Cache-Control` and
/// `X-Request-Kind` set. Errors are returned as [`ErrorResponse`] JSON.
pub async fn image_object_handler(
    State(state): State<AppState>,
    Path(params): Path<ImagePathParams>,
) -> Result<Response, TileError> {
    let response = state
        .tile_server
        .serve_request(&params.image_id, &params.object_path)
        .await?;

    let headers = [
        (header::CONTENT_TYPE, response.content_type.to_string()),
        (header::CACHE_CONTROL, response.cache_control),
        (REQUEST_KIND_HEADER, response.kind.as_str().to_string()),
    ];

    Ok((StatusCode::OK, headers, Body::from_stream(response.body)).into_response())
}

/// Accept a pushed event message.
///
/// # Endpoint
///
/// `POST /events/{kind}`
///
/// The body is decoded with the decoders registered for `kind`, so uploads
/// may arrive either as canonical events or as storage notifications.
///
/// # Response
///
/// `202 Accepted` once the event is published:
/// ```json
/// { "event_id": "0b0e...", "kind": "uploaded" }
/// ```
pub async fn ingest_event_handler(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<EventAcceptedResponse>), PipelineError> {
    let ingest = state.ingest.as_ref().ok_or_else(|| PipelineError::NotFound {
        entity: "endpoint",
        id: format!("/events/{}", kind),
    })?;

    let event = ingest.serializer.deserialize(&body, &kind)?;
    ingest.publisher.publish(&event).await?;

    debug!(event_id = event.event_id(), kind = %event.kind(), "Accepted pushed event");

    Ok((
        StatusCode::ACCEPTED,
        Json(EventAcceptedResponse {
            event_id: event.event_id().to_string(),
            kind: event.kind().to_string(),
        }),
    ))
}

/// Handle health check requests.
///
/// # Endpoint
///
/// `GET /health`
///
/// # Response
///
/// `200 OK` with JSON body:
/// ```json
/// {
///   "status": "healthy",
///   "version": "0.1.0",
///   "cache": { "hits": 10, "misses": 2, "evictions": 0, "size": 2 }
/// }
/// ```
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        cache: state.tile_server.cache_stats().into(),
    })
}
