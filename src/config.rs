//! Configuration management for the slide pipeline.
//!
//! This module provides a flexible configuration system that supports:
//! - Command-line arguments via clap
//! - Environment variables with `SLIDE_` prefix
//! - Sensible defaults for all optional settings
//!
//! # Example
//!
//! ```ignore
//! use slide_pipeline::config::Config;
//!
//! let config = Config::parse();
//! println!("Listening on {}", config.bind_address());
//! println!("S3 bucket: {}", config.s3_bucket);
//! ```
//!
//! # Environment Variables
//!
//! - `SLIDE_HOST` - Server bind address (default: 0.0.0.0)
//! - `SLIDE_PORT` - Server port (default: 3000)
//! - `SLIDE_S3_BUCKET` - S3 bucket name (required)
//! - `SLIDE_S3_ENDPOINT` - Custom S3 endpoint for S3-compatible services
//! - `SLIDE_S3_REGION` - AWS region (default: us-east-1)
//! - `SLIDE_WORKER_URL` - Endpoint of the external processing worker (required)
//! - `SLIDE_WORKER_TIMEOUT` - Worker request timeout in seconds (default: 300)
//! - `SLIDE_PROCESSING_VERSION` - Version stamped on processing requests (default: v2)
//! - `SLIDE_METADATA_TTL` - Image/content metadata cache TTL in seconds (default: 600)
//! - `SLIDE_INDEX_MAP_TTL` - Index map cache TTL in seconds (default: 1800)
//! - `SLIDE_CACHE_SWEEP_INTERVAL` - Expired-entry sweep interval in seconds, 0 disables (default: 60)
//! - `SLIDE_CACHE_MAX_ENTRIES` - Cache entry bound (default: 10000)
//! - `SLIDE_MAX_IN_FLIGHT` - Messages handled at once per subscription (default: 100)
//! - `SLIDE_EXTEND_INTERVAL` - Ack deadline extension interval in seconds (default: 30)
//! - `SLIDE_MAX_DELIVERY_ATTEMPTS` - Deliveries before the transport dead-letters (default: 10)
//! - `SLIDE_DEFAULT_TOPIC` - Topic for kinds without an override (default: slide-events)
//! - `SLIDE_TOPICS` - Comma-separated `kind=topic` overrides
//! - `SLIDE_RETRY_POLICIES` - Comma-separated `kind:max:base_ms:max_ms:multiplier` overrides
//! - `SLIDE_CACHE_MAX_AGE` - HTTP cache max-age for non-tile responses (default: 3600)
//! - `SLIDE_CORS_ORIGINS` - Comma-separated allowed origins (default: any)

use std::time::Duration;

use clap::Parser;

use crate::cache::{CacheConfig, DEFAULT_MAX_ENTRIES};
use crate::event::{parse_policy_override, EventKind, RetryPolicies, RetryPolicy};
use crate::messaging::{
    parse_topic_override, InMemoryTransportConfig, SubscriberConfig, TopicResolver,
};
use crate::pipeline::PROCESSING_VERSION;
use crate::tile::TileServerConfig;

// =============================================================================
// Default Values
// =============================================================================

pub const DEFAULT_HOST: &str = "0.0.0.0";

pub const DEFAULT_PORT: u16 = 3000;

pub const DEFAULT_REGION: &str = "us-east-1";

pub const DEFAULT_TOPIC: &str = "slide-events";

/// Default worker timeout: derivation of a large slide takes minutes.
pub const DEFAULT_WORKER_TIMEOUT_SECS: u64 = 300;

pub const DEFAULT_METADATA_TTL_SECS: u64 = 600;

pub const DEFAULT_INDEX_MAP_TTL_SECS: u64 = 1800;

pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

pub const DEFAULT_MAX_IN_FLIGHT: usize = 100;

pub const DEFAULT_EXTEND_INTERVAL_SECS: u64 = 30;

pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 10;

pub const DEFAULT_CACHE_MAX_AGE: u64 = 3600;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Slide pipeline: event-driven derivative processing and tile serving.
#[derive(Parser, Debug, Clone)]
#[command(name = "slide-pipeline")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Host address to bind to
    #[arg(long, default_value = DEFAULT_HOST, env = "SLIDE_HOST")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "SLIDE_PORT")]
    pub port: u16,

    // =========================================================================
    // S3 Configuration
    // =========================================================================
    /// S3 bucket holding slides and their derivatives
    #[arg(long, env = "SLIDE_S3_BUCKET")]
    pub s3_bucket: String,

    /// Custom S3 endpoint URL (for MinIO, GCS interop, etc.)
    #[arg(long, env = "SLIDE_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    /// AWS region
    #[arg(long, default_value = DEFAULT_REGION, env = "SLIDE_S3_REGION")]
    pub s3_region: String,

    // =========================================================================
    // Processing Configuration
    // =========================================================================
    /// URL the processing worker accepts jobs on
    #[arg(long, env = "SLIDE_WORKER_URL")]
    pub worker_url: String,

    /// Worker request timeout in seconds
    #[arg(long, default_value_t = DEFAULT_WORKER_TIMEOUT_SECS, env = "SLIDE_WORKER_TIMEOUT")]
    pub worker_timeout: u64,

    /// Processing version stamped on requests
    #[arg(long, default_value = PROCESSING_VERSION, env = "SLIDE_PROCESSING_VERSION")]
    pub processing_version: String,

    // =========================================================================
    // Cache Configuration
    // =========================================================================
    /// TTL for cached image and content metadata, in seconds
    #[arg(long, default_value_t = DEFAULT_METADATA_TTL_SECS, env = "SLIDE_METADATA_TTL")]
    pub metadata_ttl: u64,

    /// TTL for cached index maps, in seconds
    #[arg(long, default_value_t = DEFAULT_INDEX_MAP_TTL_SECS, env = "SLIDE_INDEX_MAP_TTL")]
    pub index_map_ttl: u64,

    /// Interval between expired-entry sweeps, in seconds (0 disables)
    #[arg(long, default_value_t = DEFAULT_SWEEP_INTERVAL_SECS, env = "SLIDE_CACHE_SWEEP_INTERVAL")]
    pub cache_sweep_interval: u64,

    /// Maximum cache entries before LRU eviction
    #[arg(long, default_value_t = DEFAULT_MAX_ENTRIES, env = "SLIDE_CACHE_MAX_ENTRIES")]
    pub cache_max_entries: usize,

    /// HTTP Cache-Control max-age for DZI, thumbnail and index map responses
    #[arg(long, default_value_t = DEFAULT_CACHE_MAX_AGE, env = "SLIDE_CACHE_MAX_AGE")]
    pub cache_max_age: u64,

    // =========================================================================
    // Messaging Configuration
    // =========================================================================
    /// Messages handled at once per subscription
    #[arg(long, default_value_t = DEFAULT_MAX_IN_FLIGHT, env = "SLIDE_MAX_IN_FLIGHT")]
    pub max_in_flight: usize,

    /// Ack deadline extension interval while a handler runs, in seconds
    #[arg(long, default_value_t = DEFAULT_EXTEND_INTERVAL_SECS, env = "SLIDE_EXTEND_INTERVAL")]
    pub extend_interval: u64,

    /// Deliveries per message before the transport dead-letters it
    #[arg(long, default_value_t = DEFAULT_MAX_DELIVERY_ATTEMPTS, env = "SLIDE_MAX_DELIVERY_ATTEMPTS")]
    pub max_delivery_attempts: u32,

    /// Topic for event kinds without an override
    #[arg(long, default_value = DEFAULT_TOPIC, env = "SLIDE_DEFAULT_TOPIC")]
    pub default_topic: String,

    /// Per-kind topic override, `kind=topic` (repeatable)
    #[arg(
        long = "topic",
        env = "SLIDE_TOPICS",
        value_delimiter = ',',
        value_parser = parse_topic_override
    )]
    pub topics: Vec<(EventKind, String)>,

    /// Per-kind retry policy, `kind:max_attempts:base_ms:max_ms:multiplier` (repeatable)
    #[arg(
        long = "retry-policy",
        env = "SLIDE_RETRY_POLICIES",
        value_delimiter = ',',
        value_parser = parse_policy_override
    )]
    pub retry_policies: Vec<(EventKind, RetryPolicy)>,

    // =========================================================================
    // CORS Configuration
    // =========================================================================
    /// Allowed CORS origins (comma-separated, default: any)
    #[arg(long, env = "SLIDE_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Option<Vec<String>>,

    // =========================================================================
    // Logging Configuration
    // =========================================================================
    /// Enable verbose logging
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// Disable request tracing
    #[arg(long, default_value_t = false)]
    pub no_tracing: bool,
}

impl Config {
    /// Validate the configuration.
    ///
    /// Returns an error message if the configuration is invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.s3_bucket.is_empty() {
            return Err(
                "S3 bucket name is required. Set --s3-bucket or SLIDE_S3_BUCKET".to_string(),
            );
        }

        if !(self.worker_url.starts_with("http://") || self.worker_url.starts_with("https://")) {
            return Err(format!(
                "worker_url must be an http(s) URL, got '{}'. Set --worker-url or SLIDE_WORKER_URL",
                self.worker_url
            ));
        }
        if self.worker_timeout == 0 {
            return Err("worker_timeout must be greater than 0".to_string());
        }
        if self.processing_version.is_empty() {
            return Err("processing_version must not be empty".to_string());
        }

        if self.cache_max_entries == 0 {
            return Err("cache_max_entries must be greater than 0".to_string());
        }

        if self.max_in_flight == 0 {
            return Err("max_in_flight must be greater than 0".to_string());
        }
        if self.extend_interval == 0 {
            return Err("extend_interval must be greater than 0".to_string());
        }
        if self.max_delivery_attempts == 0 {
            return Err("max_delivery_attempts must be greater than 0".to_string());
        }
        if self.default_topic.is_empty() {
            return Err("default_topic must not be empty".to_string());
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout)
    }

    pub fn tile_server_config(&self) -> TileServerConfig {
        TileServerConfig {
            metadata_ttl: Duration::from_secs(self.metadata_ttl),
            index_map_ttl: Duration::from_secs(self.index_map_ttl),
            http_max_age: self.cache_max_age,
            cache: CacheConfig {
                max_entries: self.cache_max_entries,
                sweep_interval: Duration::from_secs(self.cache_sweep_interval),
            },
        }
    }

    pub fn subscriber_config(&self) -> SubscriberConfig {
        let extend_interval = Duration::from_secs(self.extend_interval);
        SubscriberConfig {
            max_in_flight: self.max_in_flight,
            extend_interval,
            extend_by: extend_interval * 2,
        }
    }

    pub fn transport_config(&self) -> InMemoryTransportConfig {
        InMemoryTransportConfig {
            max_delivery_attempts: self.max_delivery_attempts,
            ..Default::default()
        }
    }

    /// Topic routing with the configured overrides applied.
    pub fn topic_resolver(&self) -> TopicResolver {
        self.topics
            .iter()
            .fold(TopicResolver::new(&self.default_topic), |topics, (kind, topic)| {
                topics.with(*kind, topic.clone())
            })
    }

    /// Default retry policies with the configured overrides applied.
    pub fn retry_policies(&self) -> RetryPolicies {
        let mut policies = RetryPolicies::default();
        for (kind, policy) in &self.retry_policies {
            policies.set(*kind, *policy);
        }
        policies
    }
}

// =============================================================================
// Tests
// =============================================================================
