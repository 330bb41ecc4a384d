//! HTTP server layer.
//!
//! Exposes the tile server over HTTP, plus a push endpoint that feeds
//! external messages into the event pipeline.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         HTTP Layer                              │
//! │  GET /images/{image_id}/{*object_path}   POST /events/{kind}    │
//! │                                                                 │
//! │  ┌──────────────────────────┐  ┌─────────────────────────────┐  │
//! │  │        handlers          │  │           routes            │  │
//! │  │ (requests, error mapping)│  │  (router config, CORS)      │  │
//! │  └──────────────────────────┘  └─────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod handlers;
pub mod routes;

pub use handlers::{
    health_handler, image_object_handler, ingest_event_handler, AppState, CacheStatsResponse,
    ErrorResponse, EventAcceptedResponse, EventIngest, HealthResponse, ImagePathParams,
    REQUEST_KIND_HEADER,
};
pub use routes::{create_router, RouterConfig};
