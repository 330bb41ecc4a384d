use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt, TryStreamExt};
use tokio_util::io::ReaderStream;

use super::{check_range, ByteStream, ObjectAttributes, ObjectStore, SignedUrlMethod, SignedUrlRequest};
use crate::error::IoError;
use crate::model::Content;

/// S3-backed implementation of [`ObjectStore`].
///
/// Works with S3 and S3-compatible services (MinIO, GCS interop). Object
/// bodies are streamed straight from the SDK response; ranges use HTTP range
/// requests.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn uri(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }

    async fn get_object(&self, key: &str, range: Option<String>) -> Result<ByteStream, IoError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .set_range(range)
            .send()
            .await
            .map_err(|e| get_error(e, &self.uri(key)))?;

        let body = ReaderStream::new(resp.body.into_async_read())
            .map_err(|e| IoError::Connection(e.to_string()));
        Ok(body.boxed())
    }
}

/// Map a HEAD failure, recognising 404s however the service reports them.
fn head_error(err: SdkError<HeadObjectError>, uri: &str) -> IoError {
    if err
        .as_service_error()
        .map(|se| se.is_not_found())
        .unwrap_or(false)
    {
        return IoError::NotFound(uri.to_string());
    }
    if err
        .raw_response()
        .map(|r| r.status().as_u16() == 404)
        .unwrap_or(false)
    {
        return IoError::NotFound(uri.to_string());
    }

    // Some S3-compatible services only say so in the message
    let message = err.to_string();
    if message.contains("NotFound") || message.contains("NoSuchKey") || message.contains("404") {
        return IoError::NotFound(uri.to_string());
    }
    IoError::S3(message)
}

fn get_error(err: SdkError<GetObjectError>, uri: &str) -> IoError {
    if err
        .as_service_error()
        .map(|se| se.is_no_such_key())
        .unwrap_or(false)
    {
        return IoError::NotFound(uri.to_string());
    }
    if err
        .raw_response()
        .map(|r| r.status().as_u16() == 404)
        .unwrap_or(false)
    {
        return IoError::NotFound(uri.to_string());
    }
    IoError::S3(err.to_string())
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn exists(&self, path: &str) -> Result<bool, IoError> {
        match self.get_attributes(path).await {
            Ok(_) => Ok(true),
            Err(IoError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_attributes(&self, path: &str) -> Result<ObjectAttributes, IoError> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| head_error(e, &self.uri(path)))?;

        Ok(ObjectAttributes {
            path: path.to_string(),
            size: head.content_length().unwrap_or(0).max(0) as u64,
            content_type: head.content_type().map(str::to_string),
            etag: head.e_tag().map(str::to_string),
            last_modified: head
                .last_modified()
                .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos())),
        })
    }

    async fn generate_signed_url(&self, request: &SignedUrlRequest) -> Result<String, IoError> {
        let config = PresigningConfig::expires_in(request.expires_in)
            .map_err(|e| IoError::Signing(e.to_string()))?;

        let presigned = match request.method {
            SignedUrlMethod::Get => self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&request.path)
                .presigned(config)
                .await
                .map_err(|e| IoError::Signing(e.to_string()))?,
            SignedUrlMethod::Put => self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(&request.path)
                .set_content_type(request.content_type.clone())
                .presigned(config)
                .await
                .map_err(|e| IoError::Signing(e.to_string()))?,
        };

        Ok(presigned.uri().to_string())
    }

    async fn get(&self, content: &Content) -> Result<ByteStream, IoError> {
        self.get_object(&content.path, None).await
    }

    async fn get_range(
        &self,
        content: &Content,
        offset: u64,
        length: u64,
    ) -> Result<ByteStream, IoError> {
        let end = check_range(content.size, offset, length)?;
        if length == 0 {
            return Ok(stream::empty::<Result<Bytes, IoError>>().boxed());
        }

        // "bytes=start-end", inclusive on both ends
        let range = format!("bytes={}-{}", offset, end - 1);
        self.get_object(&content.path, Some(range)).await
    }
}

/// Create an S3 client with optional custom endpoint and region.
///
/// Use a custom endpoint for S3-compatible services like MinIO:
/// ```ignore
/// let client = create_s3_client(Some("http://localhost:9000"), "us-east-1").await;
/// ```
pub async fn create_s3_client(endpoint_url: Option<&str>, region: &str) -> Client {
    let region = aws_config::Region::new(region.to_string());
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest()).region(region);

    if let Some(endpoint) = endpoint_url {
        loader = loader.endpoint_url(endpoint);
    }

    let sdk_config = loader.load().await;

    // Custom endpoints generally need path-style addressing
    let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
        .force_path_style(endpoint_url.is_some())
        .build();

    Client::from_conf(s3_config)
}
