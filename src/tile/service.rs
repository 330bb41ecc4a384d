use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::classify::{content_type_for, RequestKind, TILE_CACHE_CONTROL};
use crate::cache::{Cache, CacheConfig, CacheStats};
use crate::error::{PipelineError, TileError};
use crate::model::{tile_key, Content, Image, IndexMap};
use crate::pipeline::ImageCacheInvalidator;
use crate::repository::Repository;
use crate::storage::{read_to_bytes, ByteStream, ObjectStore};

/// Default TTL for cached image and content metadata (10 minutes)
pub const DEFAULT_METADATA_TTL: Duration = Duration::from_secs(10 * 60);

/// Default TTL for cached index maps (30 minutes)
pub const DEFAULT_INDEX_MAP_TTL: Duration = Duration::from_secs(30 * 60);

/// Default max-age for non-tile responses (1 hour)
pub const DEFAULT_HTTP_MAX_AGE: u64 = 3600;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct TileServerConfig {
    pub metadata_ttl: Duration,
    pub index_map_ttl: Duration,

    /// `max-age` sent with DZI, thumbnail and index map responses
    pub http_max_age: u64,

    pub cache: CacheConfig,
}

impl Default for TileServerConfig {
    fn default() -> Self {
        Self {
            metadata_ttl: DEFAULT_METADATA_TTL,
            index_map_ttl: DEFAULT_INDEX_MAP_TTL,
            http_max_age: DEFAULT_HTTP_MAX_AGE,
            cache: CacheConfig::default(),
        }
    }
}

// =============================================================================
// Tile Response
// =============================================================================

/// A resolved request, ready to stream back to the viewer.
pub struct TileResponse {
    pub body: ByteStream,
    pub content_type: &'static str,
    pub cache_control: String,
    pub kind: RequestKind,
}

impl fmt::Debug for TileResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileResponse")
            .field("content_type", &self.content_type)
            .field("cache_control", &self.cache_control)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tile Server
// =============================================================================

#[derive(Clone)]
enum CachedValue {
    Image(Arc<Image>),
    Content(Arc<Content>),
    IndexMap(Arc<IndexMap>),
}

fn image_key(image_id: &str) -> String {
    format!("image:{}", image_id)
}

fn content_key(image_id: &str, content_id: &str) -> String {
    format!("content:{}:{}", image_id, content_id)
}

fn index_map_key(image_id: &str, content_id: &str) -> String {
    format!("indexmap:{}:{}", image_id, content_id)
}

type InFlight = Mutex<HashMap<String, Arc<Notify>>>;

/// Removes an in-flight marker and wakes waiters, also when the fetching
/// future is dropped.
struct Flight<'a> {
    in_flight: &'a InFlight,
    key: String,
    notify: Arc<Notify>,
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        lock(self.in_flight).remove(&self.key);
        self.notify.notify_waiters();
    }
}

fn lock(in_flight: &InFlight) -> MutexGuard<'_, HashMap<String, Arc<Notify>>> {
    in_flight.lock().unwrap_or_else(|e| e.into_inner())
}

/// Resolves "image + object path" requests into object bytes.
///
/// Image, content and index map lookups are cached. Tiles come from a byte
/// range inside the image's tile archive when it has one, otherwise from
/// its tiles directory.
pub struct TileServer {
    images: Arc<dyn Repository<Image>>,
    contents: Arc<dyn Repository<Content>>,
    storage: Arc<dyn ObjectStore>,
    cache: Cache<CachedValue>,
    in_flight: InFlight,
    config: TileServerConfig,
}

impl TileServer {
    pub fn new(
        images: Arc<dyn Repository<Image>>,
        contents: Arc<dyn Repository<Content>>,
        storage: Arc<dyn ObjectStore>,
        config: TileServerConfig,
    ) -> Self {
        Self {
            images,
            contents,
            storage,
            cache: Cache::new(config.cache.clone()),
            in_flight: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &TileServerConfig {
        &self.config
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Serve one object below an image.
    pub async fn serve_request(
        &self,
        image_id: &str,
        object_path: &str,
    ) -> Result<TileResponse, TileError> {
        let kind = RequestKind::classify(object_path)?;
        let path = object_path.trim_start_matches('/');
        let image = self.image(image_id).await?;

        let body = match kind {
            RequestKind::Dzi => {
                let content = self
                    .artifact(&image, image.dzi_content_id.as_deref(), "dzi")
                    .await?;
                self.storage.get(&content).await?
            }
            RequestKind::Thumbnail => {
                let content = self
                    .artifact(&image, image.thumbnail_content_id.as_deref(), "thumbnail")
                    .await?;
                self.storage.get(&content).await?
            }
            RequestKind::IndexMap => {
                let content = self
                    .artifact(&image, image.indexmap_content_id.as_deref(), "index map")
                    .await?;
                self.storage.get(&content).await?
            }
            RequestKind::Tile => self.tile(&image, path).await?,
        };

        let cache_control = match kind {
            RequestKind::Tile => TILE_CACHE_CONTROL.to_string(),
            _ => format!("public, max-age={}", self.config.http_max_age),
        };

        debug!(image_id, path, kind = %kind, "Serving object");

        Ok(TileResponse {
            body,
            content_type: content_type_for(path),
            cache_control,
            kind,
        })
    }

    /// Drop every cached entry that belongs to an image.
    pub async fn invalidate_image(&self, image_id: &str) {
        let removed = self.cache.delete(&image_key(image_id)).await as usize
            + self
                .cache
                .delete_pattern(&format!("content:{}:*", image_id))
                .await
            + self
                .cache
                .delete_pattern(&format!("indexmap:{}:*", image_id))
                .await;
        debug!(image_id, removed, "Invalidated image cache");
    }

    async fn tile(&self, image: &Image, path: &str) -> Result<ByteStream, TileError> {
        // The archive takes precedence over a tiles directory
        if let Some(archive_id) = image.zip_tiles_content_id.as_deref() {
            let index = self.index_map(image).await?;
            let key = tile_key(path);
            let range = index.get(key).ok_or_else(|| TileError::TileNotFound {
                key: key.to_string(),
            })?;
            let archive = self.content(&image.id, archive_id, "tile archive").await?;
            return Ok(self
                .storage
                .get_range(&archive, range.offset, range.length)
                .await?);
        }

        if let Some(directory_id) = image.tiles_content_id.as_deref() {
            let directory = self
                .content(&image.id, directory_id, "tiles directory")
                .await?;
            return Ok(self.storage.get(&directory.child(path)).await?);
        }

        Err(TileError::NoTileStorageConfigured(image.id.clone()))
    }

    async fn image(&self, image_id: &str) -> Result<Arc<Image>, TileError> {
        let key = image_key(image_id);
        if let Some(CachedValue::Image(image)) = self.cache.get(&key).await {
            return Ok(image);
        }

        let image = match self.images.read(image_id).await {
            Ok(image) => Arc::new(image),
            Err(PipelineError::ImageEntityNotFound(_)) => {
                return Err(TileError::ImageNotFound(image_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        self.cache
            .set(key, CachedValue::Image(image.clone()), self.config.metadata_ttl)
            .await;
        Ok(image)
    }

    async fn artifact(
        &self,
        image: &Image,
        content_id: Option<&str>,
        artifact: &'static str,
    ) -> Result<Arc<Content>, TileError> {
        let content_id = content_id.ok_or_else(|| TileError::ArtifactNotFound {
            image_id: image.id.clone(),
            artifact,
        })?;
        self.content(&image.id, content_id, artifact).await
    }

    async fn content(
        &self,
        image_id: &str,
        content_id: &str,
        artifact: &'static str,
    ) -> Result<Arc<Content>, TileError> {
        let key = content_key(image_id, content_id);
        if let Some(CachedValue::Content(content)) = self.cache.get(&key).await {
            return Ok(content);
        }

        let content = match self.contents.read(content_id).await {
            Ok(content) => Arc::new(content),
            Err(PipelineError::ContentNotFound(_)) => {
                return Err(TileError::ArtifactNotFound {
                    image_id: image_id.to_string(),
                    artifact,
                })
            }
            Err(e) => return Err(e.into()),
        };

        self.cache
            .set(key, CachedValue::Content(content.clone()), self.config.metadata_ttl)
            .await;
        Ok(content)
    }

    /// Load the image's index map, sharing one fetch between concurrent misses.
    async fn index_map(&self, image: &Image) -> Result<Arc<IndexMap>, TileError> {
        let content_id =
            image
                .indexmap_content_id
                .as_deref()
                .ok_or_else(|| TileError::ArtifactNotFound {
                    image_id: image.id.clone(),
                    artifact: "index map",
                })?;
        let key = index_map_key(&image.id, content_id);

        loop {
            if let Some(CachedValue::IndexMap(map)) = self.cache.get(&key).await {
                return Ok(map);
            }

            let leader = {
                let mut in_flight = lock(&self.in_flight);
                match in_flight.get(&key) {
                    Some(notify) => Err(notify.clone()),
                    None => {
                        let notify = Arc::new(Notify::new());
                        in_flight.insert(key.clone(), notify.clone());
                        Ok(Flight {
                            in_flight: &self.in_flight,
                            key: key.clone(),
                            notify,
                        })
                    }
                }
            };

            let flight = match leader {
                Ok(flight) => flight,
                Err(notify) => {
                    let notified = notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();

                    // The leader may have finished before we registered
                    let still_running = lock(&self.in_flight)
                        .get(&key)
                        .is_some_and(|current| Arc::ptr_eq(current, &notify));
                    if still_running {
                        notified.await;
                    }
                    continue;
                }
            };

            let result = self.fetch_index_map(&image.id, content_id).await;
            if let Ok(map) = &result {
                self.cache
                    .set(
                        key.clone(),
                        CachedValue::IndexMap(map.clone()),
                        self.config.index_map_ttl,
                    )
                    .await;
            }
            drop(flight);
            return result;
        }
    }

    async fn fetch_index_map(
        &self,
        image_id: &str,
        content_id: &str,
    ) -> Result<Arc<IndexMap>, TileError> {
        let content = self.content(image_id, content_id, "index map").await?;
        let bytes = read_to_bytes(self.storage.get(&content).await?).await?;
        let map = IndexMap::from_slice(&content.path, &bytes)?;

        info!(image_id, tiles = map.len(), "Loaded index map");
        Ok(Arc::new(map))
    }
}

#[async_trait]
impl ImageCacheInvalidator for TileServer {
    async fn invalidate_image(&self, image_id: &str) {
        TileServer::invalidate_image(self, image_id).await;
    }
}
