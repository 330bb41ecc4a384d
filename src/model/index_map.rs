use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::IoError;

/// Byte range of one tile inside a tile archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileRange {
    pub offset: u64,
    pub length: u64,
}

/// Per-image table mapping a tile key (`"{level}/{col}_{row}"`) to its
/// location inside the archive. Generated by the external worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexMap {
    #[serde(default)]
    pub version: String,
    pub tiles: HashMap<String, TileRange>,
}

impl IndexMap {
    /// Parse an index map from the bytes of its JSON object.
    pub fn from_slice(path: &str, bytes: &[u8]) -> Result<Self, IoError> {
        serde_json::from_slice(bytes).map_err(|e| IoError::InvalidBody {
            path: path.to_string(),
            message: e.to_string(),
        })
    }

    pub fn get(&self, key: &str) -> Option<TileRange> {
        self.tiles.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}

/// Strip the extension from a requested tile path to form its index key.
///
/// Only the final path component is considered, so dots in directory
/// names are preserved.
pub fn tile_key(path: &str) -> &str {
    let path = path.trim_start_matches('/');
    let file_start = path.rfind('/').map(|i| i + 1).unwrap_or(0);
    match path[file_start..].rfind('.') {
        Some(dot) => &path[..file_start + dot],
        None => path,
    }
}
