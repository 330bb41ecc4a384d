//! Tile serving layer.
//!
//! Turns a logical "image + object path" request into bytes pulled from the
//! object store, either as a whole object or as a byte range inside the
//! image's tile archive.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              HTTP Handlers              │
//! └────────────────────┬────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │               TileServer                │
//! │  ┌──────────────┐  ┌─────────────────┐  │
//! │  │ RequestKind  │  │  Cache (image,  │  │
//! │  │ classifier   │  │  content, index │  │
//! │  │              │  │  map)           │  │
//! │  └──────────────┘  └─────────────────┘  │
//! └──────────┬─────────────────────┬────────┘
//!            │                     │
//!            ▼                     ▼
//! ┌──────────────────────┐ ┌────────────────┐
//! │ Repository<Image>    │ │  ObjectStore   │
//! │ Repository<Content>  │ │  (get, range)  │
//! └──────────────────────┘ └────────────────┘
//! ```
//!
//! # Components
//!
//! - [`TileServer`]: resolves requests and owns the metadata cache
//! - [`RequestKind`]: DZI, thumbnail, index map or tile, chosen from the path
//! - [`TileResponse`]: body stream plus the headers to send with it

mod classify;
mod service;

pub use classify::{content_type_for, RequestKind, TILE_CACHE_CONTROL};
pub use service::{
    TileResponse, TileServer, TileServerConfig, DEFAULT_HTTP_MAX_AGE, DEFAULT_INDEX_MAP_TTL,
    DEFAULT_METADATA_TTL,
};
