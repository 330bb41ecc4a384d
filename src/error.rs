use std::fmt;

use thiserror::Error;

use crate::event::EventKind;

/// Boxed error kept as the cause of an internal failure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

// =============================================================================
// Taxonomy
// =============================================================================

/// Coarse classification shared by every error the core returns.
///
/// The subscriber uses this to decide between dropping a message and leaving
/// it for redelivery; the HTTP layer uses it to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad input or payload shape
    Validation,
    /// Missing entity, content or tile
    NotFound,
    /// Duplicate, in-use, or an illegal state transition
    Conflict,
    /// Passed through from outer layers
    Unauthorized,
    /// Passed through from outer layers
    Forbidden,
    /// Lower-layer failure (storage, transport, worker)
    Internal,
}

impl ErrorKind {
    /// Whether redelivering the message can change the outcome.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Internal)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Pipeline Errors
// =============================================================================

/// Errors returned by repositories, the unit of work and pipeline handlers.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Input failed validation
    #[error("validation failed: {0}")]
    Validation(String),

    /// The parent image of an event does not exist
    #[error("image entity not found: {0}")]
    ImageEntityNotFound(String),

    /// A content row does not exist
    #[error("content not found: {0}")]
    ContentNotFound(String),

    /// Any other missing entity
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Duplicate entity or a state change the entity refuses
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Wraps a lower-layer failure, always keeping the cause
    #[error("{context}: {source}")]
    Internal {
        context: String,
        #[source]
        source: BoxError,
    },
}

impl PipelineError {
    /// Wrap a lower-layer error as [`PipelineError::Internal`].
    pub fn internal(
        context: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        PipelineError::Internal {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Validation(_) => ErrorKind::Validation,
            PipelineError::ImageEntityNotFound(_)
            | PipelineError::ContentNotFound(_)
            | PipelineError::NotFound { .. } => ErrorKind::NotFound,
            PipelineError::Conflict(_) => ErrorKind::Conflict,
            PipelineError::Unauthorized(_) => ErrorKind::Unauthorized,
            PipelineError::Forbidden(_) => ErrorKind::Forbidden,
            PipelineError::Internal { .. } => ErrorKind::Internal,
        }
    }
}

impl From<IoError> for PipelineError {
    fn from(err: IoError) -> Self {
        match err {
            IoError::NotFound(path) => PipelineError::NotFound {
                entity: "object",
                id: path,
            },
            other => PipelineError::internal("object storage", other),
        }
    }
}

impl From<SerializeError> for PipelineError {
    fn from(err: SerializeError) -> Self {
        match err {
            SerializeError::Json(e) => PipelineError::internal("event encoding", e),
            other => PipelineError::Validation(other.to_string()),
        }
    }
}

impl From<TransportError> for PipelineError {
    fn from(err: TransportError) -> Self {
        PipelineError::internal("message transport", err)
    }
}

// =============================================================================
// Storage Errors
// =============================================================================

/// I/O errors that can occur when reading from remote storage
#[derive(Debug, Clone, Error)]
pub enum IoError {
    /// Error from S3 or S3-compatible storage
    #[error("S3 error: {0}")]
    S3(String),

    /// Requested range exceeds resource bounds
    #[error("Range out of bounds: requested {requested} bytes at offset {offset}, size is {size}")]
    RangeOutOfBounds {
        offset: u64,
        requested: u64,
        size: u64,
    },

    /// Network or connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Object not found
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Signed URL could not be produced
    #[error("Signing error: {0}")]
    Signing(String),

    /// Object body could not be decoded
    #[error("Invalid object body for {path}: {message}")]
    InvalidBody { path: String, message: String },
}

impl IoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IoError::NotFound(_) => ErrorKind::NotFound,
            _ => ErrorKind::Internal,
        }
    }
}

// =============================================================================
// Serializer Errors
// =============================================================================

/// Errors produced while encoding or decoding events.
#[derive(Debug, Error)]
pub enum SerializeError {
    /// The kind name is not one of the registered event kinds
    #[error("unsupported event kind: {0}")]
    UnsupportedKind(String),

    /// A storage notification arrived without a metadata field the pipeline needs
    #[error("storage notification is missing required metadata field '{0}'")]
    MissingRequiredMetadata(&'static str),

    /// No decoder recognised the payload
    #[error("unsupported payload for {kind}: {reason}")]
    UnsupportedPayload { kind: EventKind, reason: String },

    /// Encoding failed
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

// =============================================================================
// Transport Errors
// =============================================================================

/// Errors from the message transport backend.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Publish was rejected or never acknowledged
    #[error("publish to '{topic}' failed: {message}")]
    Publish { topic: String, message: String },

    /// The subscription does not exist
    #[error("unknown subscription: {0}")]
    UnknownSubscription(String),

    /// The transport has shut down
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Whether the same call may succeed if repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Publish { .. })
    }
}

// =============================================================================
// Tile Errors
// =============================================================================

/// Errors returned by the tile server.
#[derive(Debug, Error)]
pub enum TileError {
    /// Object path did not match any request class
    #[error("unknown request type for path '{0}'")]
    UnknownRequestType(String),

    /// Image does not exist
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Image exists but the artifact pointer for the request is unset
    #[error("{artifact} not available for image {image_id}")]
    ArtifactNotFound {
        image_id: String,
        artifact: &'static str,
    },

    /// Tile key is absent from the index map
    #[error("tile not found in index map: {key}")]
    TileNotFound { key: String },

    /// Image has neither a tile archive nor a tiles directory
    #[error("no tile storage configured for image {0}")]
    NoTileStorageConfigured(String),

    /// Repository failure
    #[error("metadata lookup failed: {0}")]
    Repository(#[from] PipelineError),

    /// Storage failure
    #[error("storage error: {0}")]
    Io(#[from] IoError),
}

impl TileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TileError::UnknownRequestType(_) => ErrorKind::Validation,
            TileError::ImageNotFound(_)
            | TileError::ArtifactNotFound { .. }
            | TileError::TileNotFound { .. }
            | TileError::NoTileStorageConfigured(_) => ErrorKind::NotFound,
            TileError::Repository(e) => e.kind(),
            TileError::Io(e) => e.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_error_kinds() {
        assert_eq!(
            PipelineError::ImageEntityNotFound("img".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            PipelineError::Validation("bad".into()).kind(),
            ErrorKind::Validation
        );
        let internal = PipelineError::internal("worker", IoError::Connection("reset".into()));
        assert_eq!(internal.kind(), ErrorKind::Internal);
        assert!(std::error::Error::source(&internal).is_some());
    }

    #[test]
    fn test_only_internal_is_retryable() {
        assert!(ErrorKind::Internal.is_retryable());
        assert!(!ErrorKind::NotFound.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::Conflict.is_retryable());
    }

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let err: PipelineError = IoError::NotFound("s3://b/k".into()).into();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err: PipelineError = IoError::S3("throttled".into()).into();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_tile_error_kinds() {
        assert_eq!(
            TileError::UnknownRequestType("x".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            TileError::TileNotFound { key: "0/0_0".into() }.kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            TileError::Io(IoError::Connection("down".into())).kind(),
            ErrorKind::Internal
        );
    }
}
