use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{stream, StreamExt};

use super::{check_range, ByteStream, ObjectAttributes, ObjectStore, SignedUrlMethod, SignedUrlRequest};
use crate::error::IoError;
use crate::model::Content;

/// Object store held in process memory.
///
/// Counts whole-object and ranged reads so callers can assert how often
/// storage was touched.
#[derive(Clone, Default)]
pub struct InMemoryObjectStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    objects: Mutex<HashMap<String, Bytes>>,
    gets: AtomicU64,
    range_gets: AtomicU64,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: impl Into<String>, data: impl Into<Bytes>) {
        let mut objects = self.inner.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects.insert(path.into(), data.into());
    }

    pub fn remove(&self, path: &str) -> bool {
        let mut objects = self.inner.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects.remove(path).is_some()
    }

    /// Number of whole-object reads served.
    pub fn get_count(&self) -> u64 {
        self.inner.gets.load(Ordering::Relaxed)
    }

    /// Number of ranged reads served.
    pub fn range_count(&self) -> u64 {
        self.inner.range_gets.load(Ordering::Relaxed)
    }

    fn lookup(&self, path: &str) -> Result<Bytes, IoError> {
        let objects = self.inner.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects
            .get(path)
            .cloned()
            .ok_or_else(|| IoError::NotFound(format!("memory://{}", path)))
    }
}

fn once(data: Bytes) -> ByteStream {
    stream::once(async move { Ok(data) }).boxed()
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn exists(&self, path: &str) -> Result<bool, IoError> {
        Ok(self.lookup(path).is_ok())
    }

    async fn get_attributes(&self, path: &str) -> Result<ObjectAttributes, IoError> {
        let data = self.lookup(path)?;
        Ok(ObjectAttributes {
            path: path.to_string(),
            size: data.len() as u64,
            content_type: None,
            etag: None,
            last_modified: None,
        })
    }

    async fn generate_signed_url(&self, request: &SignedUrlRequest) -> Result<String, IoError> {
        let method = match request.method {
            SignedUrlMethod::Get => "GET",
            SignedUrlMethod::Put => "PUT",
        };
        let expires = Utc::now().timestamp() + request.expires_in.as_secs() as i64;
        Ok(format!(
            "memory://{}?method={}&expires={}",
            request.path, method, expires
        ))
    }

    async fn get(&self, content: &Content) -> Result<ByteStream, IoError> {
        let data = self.lookup(&content.path)?;
        self.inner.gets.fetch_add(1, Ordering::Relaxed);
        Ok(once(data))
    }

    async fn get_range(
        &self,
        content: &Content,
        offset: u64,
        length: u64,
    ) -> Result<ByteStream, IoError> {
        let data = self.lookup(&content.path)?;
        let size = data.len() as u64;
        let end = check_range(size, offset, length)?;
        if length == 0 {
            return Ok(stream::empty().boxed());
        }
        // An empty object has a known size here, unlike in `check_range`
        if end > size {
            return Err(IoError::RangeOutOfBounds {
                offset,
                requested: length,
                size,
            });
        }
        self.inner.range_gets.fetch_add(1, Ordering::Relaxed);
        Ok(once(data.slice(offset as usize..end as usize)))
    }
}
