//! Content: one physical artifact in object storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::repository::Entity;

// =============================================================================
// Content Type
// =============================================================================

/// Raster formats the pipeline recognises for source slides and thumbnails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    Svs,
    Tiff,
    Ndpi,
    Mrxs,
    Jpeg,
    Png,
}

impl ImageFormat {
    fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "svs" => Some(ImageFormat::Svs),
            "tif" | "tiff" => Some(ImageFormat::Tiff),
            "ndpi" => Some(ImageFormat::Ndpi),
            "mrxs" => Some(ImageFormat::Mrxs),
            "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
            "png" => Some(ImageFormat::Png),
            _ => None,
        }
    }
}

/// Classified type of a content object.
///
/// Callers ask predicate questions (`is_thumbnail`, `is_archive`, ...)
/// instead of switching on MIME strings themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "format", rename_all = "snake_case")]
pub enum ContentType {
    /// A slide image (the origin of a processing run)
    Image(ImageFormat),
    /// A small preview rendered from the slide
    Thumbnail(ImageFormat),
    /// Deep Zoom descriptor
    Dzi,
    /// JSON table of tile byte ranges inside the archive
    IndexMap,
    /// Zip-style tile archive
    TileArchive,
    /// Prefix under which individual tiles are stored
    TilesDirectory,
    /// Reports and other attachments
    Document,
    Other,
}

/// Category of a [`ContentType`], used to pick the image pointer to repoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentCategory {
    Image,
    Thumbnail,
    Dzi,
    IndexMap,
    Archive,
    Tiles,
    Document,
    Other,
}

impl ContentType {
    /// Infer the content type from an object path.
    ///
    /// Order matters: the index map is a `.json` file and thumbnails are
    /// ordinary JPEG/PNG files distinguished only by name.
    pub fn from_path(path: &str) -> Self {
        let lower = path.to_ascii_lowercase();
        let trimmed = lower.trim_end_matches('/');
        let file_name = trimmed.rsplit('/').next().unwrap_or(trimmed);

        if file_name.ends_with("indexmap.json") {
            return ContentType::IndexMap;
        }
        if file_name.ends_with(".dzi") {
            return ContentType::Dzi;
        }
        if file_name.ends_with(".zip") {
            return ContentType::TileArchive;
        }
        if lower.ends_with('/') || file_name.ends_with("_files") {
            return ContentType::TilesDirectory;
        }

        let ext = file_name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
        if let Some(format) = ImageFormat::from_extension(ext) {
            if file_name.contains("thumbnail") || file_name.starts_with("thumb") {
                return ContentType::Thumbnail(format);
            }
            return ContentType::Image(format);
        }

        match ext {
            "pdf" | "doc" | "docx" | "txt" | "csv" => ContentType::Document,
            _ => ContentType::Other,
        }
    }

    pub fn category(&self) -> ContentCategory {
        match self {
            ContentType::Image(_) => ContentCategory::Image,
            ContentType::Thumbnail(_) => ContentCategory::Thumbnail,
            ContentType::Dzi => ContentCategory::Dzi,
            ContentType::IndexMap => ContentCategory::IndexMap,
            ContentType::TileArchive => ContentCategory::Archive,
            ContentType::TilesDirectory => ContentCategory::Tiles,
            ContentType::Document => ContentCategory::Document,
            ContentType::Other => ContentCategory::Other,
        }
    }

    /// True for slide images and thumbnails alike.
    pub fn is_image(&self) -> bool {
        matches!(self, ContentType::Image(_) | ContentType::Thumbnail(_))
    }

    pub fn is_thumbnail(&self) -> bool {
        matches!(self, ContentType::Thumbnail(_))
    }

    pub fn is_dzi(&self) -> bool {
        matches!(self, ContentType::Dzi)
    }

    pub fn is_index_map(&self) -> bool {
        matches!(self, ContentType::IndexMap)
    }

    pub fn is_archive(&self) -> bool {
        matches!(self, ContentType::TileArchive)
    }

    pub fn is_tiles(&self) -> bool {
        matches!(self, ContentType::TilesDirectory)
    }

    pub fn is_document(&self) -> bool {
        matches!(self, ContentType::Document)
    }

    /// MIME type used when storing or serving this content.
    pub fn mime(&self) -> &'static str {
        match self {
            ContentType::Image(format) | ContentType::Thumbnail(format) => match format {
                ImageFormat::Jpeg => "image/jpeg",
                ImageFormat::Png => "image/png",
                ImageFormat::Tiff | ImageFormat::Svs | ImageFormat::Ndpi => "image/tiff",
                ImageFormat::Mrxs => "application/octet-stream",
            },
            ContentType::Dzi => "application/xml",
            ContentType::IndexMap => "application/json",
            ContentType::TileArchive => "application/zip",
            ContentType::Document => "application/pdf",
            ContentType::TilesDirectory | ContentType::Other => "application/octet-stream",
        }
    }
}

// =============================================================================
// Content
// =============================================================================

/// One physical artifact: the origin slide or one of its derivatives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub id: String,

    /// Id of the owning image
    pub parent: Option<String>,

    /// Storage backend identifier (e.g. "s3", "gcs")
    pub provider: String,

    /// Object key inside the provider
    pub path: String,

    pub content_type: ContentType,

    /// Size in bytes, when known
    #[serde(default)]
    pub size: u64,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Content {
    /// Create a content row with a fresh id and a type inferred from the path.
    pub fn new(
        parent: impl Into<String>,
        provider: impl Into<String>,
        path: impl Into<String>,
        size: u64,
    ) -> Self {
        let path = path.into();
        Self {
            id: Uuid::new_v4().to_string(),
            parent: Some(parent.into()),
            provider: provider.into(),
            content_type: ContentType::from_path(&path),
            path,
            size,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    /// A transient handle for an object below this content's path.
    ///
    /// Used to read individual tiles out of a tiles directory; the result is
    /// never persisted.
    pub fn child(&self, relative: &str) -> Content {
        let path = format!(
            "{}/{}",
            self.path.trim_end_matches('/'),
            relative.trim_start_matches('/')
        );
        Content {
            id: format!("{}:{}", self.id, relative),
            parent: self.parent.clone(),
            provider: self.provider.clone(),
            content_type: ContentType::from_path(&path),
            path,
            size: 0,
            created_at: self.created_at,
            deleted_at: None,
        }
    }
}

/// Field updates accepted by the content repository.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentField {
    Size(u64),
    Provider(String),
}

impl Entity for Content {
    type Field = ContentField;

    const NAME: &'static str = "content";

    fn id(&self) -> &str {
        &self.id
    }

    fn apply(&mut self, field: &ContentField) -> Result<(), PipelineError> {
        match field {
            ContentField::Size(size) => self.size = *size,
            ContentField::Provider(provider) => self.provider = provider.clone(),
        }
        Ok(())
    }

    fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    fn mark_deleted(&mut self, at: DateTime<Utc>) {
        self.deleted_at = Some(at);
    }

    fn not_found(id: &str) -> PipelineError {
        PipelineError::ContentNotFound(id.to_string())
    }
}
