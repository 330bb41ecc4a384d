//! Domain model touched by the pipeline.
//!
//! - [`Image`]: aggregate root for a slide, holding one pointer per artifact
//!   and the processing state machine
//! - [`Content`]: one physical object in storage, classified by [`ContentType`]
//! - [`IndexMap`]: tile byte ranges inside an archive

mod content;
mod image;
mod index_map;

pub use content::{Content, ContentCategory, ContentField, ContentType, ImageFormat};
pub use image::{Image, ImageField, Processing, ProcessingStatus};
pub use index_map::{tile_key, IndexMap, TileRange};
