//! Object storage contract.
//!
//! The tile server and the pipeline only ever see [`ObjectStore`]; the
//! S3 adapter serves production traffic and the in-memory adapter backs
//! tests and local runs.

mod memory;
mod s3;

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::TryStreamExt;

use crate::error::IoError;
use crate::model::Content;

pub use memory::InMemoryObjectStore;
pub use s3::{create_s3_client, S3ObjectStore};

/// Streaming object body.
pub type ByteStream = BoxStream<'static, Result<Bytes, IoError>>;

/// Metadata for a stored object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectAttributes {
    pub path: String,
    pub size: u64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// HTTP method a signed URL is valid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignedUrlMethod {
    Get,
    Put,
}

/// Parameters for [`ObjectStore::generate_signed_url`].
#[derive(Debug, Clone)]
pub struct SignedUrlRequest {
    pub path: String,
    pub method: SignedUrlMethod,
    pub expires_in: Duration,
    /// Content type the uploader must send (PUT only)
    pub content_type: Option<String>,
}

impl SignedUrlRequest {
    pub fn get(path: impl Into<String>, expires_in: Duration) -> Self {
        Self {
            path: path.into(),
            method: SignedUrlMethod::Get,
            expires_in,
            content_type: None,
        }
    }

    pub fn put(path: impl Into<String>, expires_in: Duration, content_type: Option<String>) -> Self {
        Self {
            path: path.into(),
            method: SignedUrlMethod::Put,
            expires_in,
            content_type,
        }
    }
}

/// Read access to the object store holding slides and their derivatives.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool, IoError>;

    async fn get_attributes(&self, path: &str) -> Result<ObjectAttributes, IoError>;

    async fn generate_signed_url(&self, request: &SignedUrlRequest) -> Result<String, IoError>;

    /// Stream the whole object behind `content`.
    async fn get(&self, content: &Content) -> Result<ByteStream, IoError>;

    /// Stream `length` bytes starting at `offset`.
    ///
    /// A zero-length range yields an empty stream without touching storage.
    async fn get_range(
        &self,
        content: &Content,
        offset: u64,
        length: u64,
    ) -> Result<ByteStream, IoError>;
}

/// Collect a body stream into one buffer.
pub async fn read_to_bytes(stream: ByteStream) -> Result<Bytes, IoError> {
    let buf = stream
        .try_fold(BytesMut::new(), |mut buf, chunk| async move {
            buf.extend_from_slice(&chunk);
            Ok(buf)
        })
        .await?;
    Ok(buf.freeze())
}

/// Check a range against a known object size and return its exclusive end.
/// A size of zero means unknown; only overflow is rejected then.
pub(crate) fn check_range(size: u64, offset: u64, length: u64) -> Result<u64, IoError> {
    let out_of_bounds = || IoError::RangeOutOfBounds {
        offset,
        requested: length,
        size,
    };
    let end = offset.checked_add(length).ok_or_else(out_of_bounds)?;
    if size > 0 && end > size {
        return Err(out_of_bounds());
    }
    Ok(end)
}
