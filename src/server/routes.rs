//! Router configuration for the tile surface.
//!
//! # Route Structure
//!
//! ```text
//! /health                               - Health check
//! /images/{image_id}/{*object_path}     - DZI, thumbnail, index map and tiles
//! /events/{kind}                        - Event push (only with ingest configured)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use slide_pipeline::server::{create_router, RouterConfig};
//!
//! let config = RouterConfig::new()
//!     .with_cors_origins(vec!["https://viewer.example.com".to_string()]);
//!
//! let router = create_router(AppState::new(tile_server), config);
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//! axum::serve(listener, router).await?;
//! ```

use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::Method;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{health_handler, image_object_handler, ingest_event_handler, AppState};

// =============================================================================
// Router Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Allowed CORS origins (None = any origin)
    pub cors_origins: Option<Vec<String>>,

    /// Whether to attach the HTTP trace layer
    pub enable_tracing: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterConfig {
    pub fn new() -> Self {
        Self {
            cors_origins: None,
            enable_tracing: true,
        }
    }

    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Some(origins);
        self
    }

    pub fn with_cors_any_origin(mut self) -> Self {
        self.cors_origins = None;
        self
    }

    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.enable_tracing = enabled;
        self
    }
}

// =============================================================================
// Router Builder
// =============================================================================

/// Build the router for the tile surface.
pub fn create_router(app_state: AppState, config: RouterConfig) -> Router {
    let cors = build_cors_layer(&config);

    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/images/{image_id}/{*object_path}", get(image_object_handler));
    if app_state.ingest.is_some() {
        router = router.route("/events/{kind}", post(ingest_event_handler));
    }

    let router = router.with_state(app_state).layer(cors);

    if config.enable_tracing {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

fn build_cors_layer(config: &RouterConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::HEAD, Method::POST, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .max_age(Duration::from_secs(86400));

    match &config.cors_origins {
        None => cors.allow_origin(Any),
        // No origins allowed, which disables CORS
        Some(origins) if origins.is_empty() => cors,
        Some(origins) => {
            let parsed: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
            cors.allow_origin(parsed)
        }
    }
}
