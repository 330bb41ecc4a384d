use std::fmt;

use crate::error::TileError;

/// Cache-Control for tiles: content-addressed, never changes once written.
pub const TILE_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

/// What a request under `/images/{id}/...` is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Dzi,
    Thumbnail,
    IndexMap,
    Tile,
}

impl RequestKind {
    /// Classify an object path. First match wins:
    ///
    /// 1. ends with `.dzi`
    /// 2. contains `thumbnail` or starts with `thumb`
    /// 3. ends with `indexmap.json`
    /// 4. contains `/`
    pub fn classify(object_path: &str) -> Result<Self, TileError> {
        let path = object_path.trim_start_matches('/');

        if path.ends_with(".dzi") {
            Ok(RequestKind::Dzi)
        } else if path.contains("thumbnail") || path.starts_with("thumb") {
            Ok(RequestKind::Thumbnail)
        } else if path.ends_with("indexmap.json") {
            Ok(RequestKind::IndexMap)
        } else if path.contains('/') {
            Ok(RequestKind::Tile)
        } else {
            Err(TileError::UnknownRequestType(object_path.to_string()))
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Dzi => "dzi",
            RequestKind::Thumbnail => "thumbnail",
            RequestKind::IndexMap => "indexmap",
            RequestKind::Tile => "tile",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response content type, chosen from the requested path's extension.
pub fn content_type_for(object_path: &str) -> &'static str {
    let ext = object_path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "dzi" => "application/xml",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}
