//! Slide Pipeline - event-driven derivative processing and tile serving for
//! Whole Slide Images.
//!
//! Uploaded slides flow through a chain of events: an upload requests
//! processing, an external worker derives the thumbnail, Deep Zoom
//! descriptor, tile archive and index map, and each produced artifact is
//! registered against its image until the image is complete. Viewers then
//! read DZI descriptors and tiles through a cached tile server.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         HTTP Layer                              │
//! │        GET /images/{image_id}/{*object_path}, /health          │
//! └─────────────────────────────────────────────────────────────────┘
//!            │                                        │
//!            ▼                                        ▼
//! ┌──────────────────────┐            ┌─────────────────────────────┐
//! │     Tile Server      │◀─invalidate─│     Pipeline Handlers       │
//! │ (cache, index maps)  │            │ upload → process → complete │
//! └──────────────────────┘            │ → new file → dlq / delete   │
//!            │                        └─────────────────────────────┘
//!            │                           │                  ▲
//!            ▼                           ▼                  │
//! ┌──────────────────────┐   ┌──────────────────┐  ┌────────────────┐
//! │    Object Storage    │   │   Repositories   │  │   Messaging    │
//! │  (S3, in-memory)     │   │  (unit of work)  │  │ (pub/sub, DLQ) │
//! └──────────────────────┘   └──────────────────┘  └────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`event`]: event envelope, payloads, retry policies and the serializer
//! - [`messaging`]: transport port, publisher, subscriber and the in-memory transport
//! - [`pipeline`]: one handler per event kind plus the runners that drive them
//! - [`repository`]: repository and unit-of-work ports with an in-memory store
//! - [`tile`]: the tile cache/proxy
//! - [`storage`]: object storage port with S3 and in-memory adapters
//! - [`cache`]: TTL + LRU cache with pattern deletion
//! - [`model`]: images, contents and index maps
//! - [`server`]: HTTP handlers and router

pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod messaging;
pub mod model;
pub mod pipeline;
pub mod repository;
pub mod server;
pub mod storage;
pub mod tile;

// Re-export commonly used types
pub use cache::{Cache, CacheConfig, CacheStats};
pub use config::Config;
pub use error::{ErrorKind, IoError, PipelineError, SerializeError, TileError, TransportError};
pub use event::{Event, EventKind, Payload, RetryMetadata, RetryPolicies, RetryPolicy};
pub use messaging::{InMemoryTransport, Publisher, TransportPublisher, TransportSubscriber};
pub use model::{Content, ContentType, Image, IndexMap, ProcessingStatus};
pub use pipeline::{EventHandler, HandlerRunner, PipelineContext};
pub use repository::{MemoryStore, Repository, UnitOfWork};
pub use server::{create_router, AppState, RouterConfig};
pub use storage::{create_s3_client, InMemoryObjectStore, ObjectStore, S3ObjectStore};
pub use tile::{TileResponse, TileServer, TileServerConfig};
