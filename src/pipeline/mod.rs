//! Event handlers driving an image through derivative generation.
//!
//! ```text
//!  uploaded ─────────► UploadHandler ──────────► image_process_requested
//!                                                          │
//!  image_process_requested ─► ProcessRequestHandler ─► ImageProcessor (worker)
//!                                                          │
//!  image_process_completed ─► ProcessCompleteHandler ─┬─► new_file_exist × N
//!                                                     └─► image_process_dlq
//!  new_file_exist ──► NewFileHandler    (transactional register + promote)
//!  image_process_dlq ► DlqHandler       (failed_permanent + alert)
//!  delete, delete_file ► DeleteHandler  (soft delete)
//! ```
//!
//! Every handler tolerates redelivery of the same event: repointing the
//! same artifact twice or promoting an already processed image is a no-op.

mod delete;
mod dlq;
mod new_file;
mod process_complete;
mod process_request;
mod processor;
mod runner;
mod upload;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use crate::error::PipelineError;
use crate::event::{Event, EventKind, RetryMetadata, RetryPolicies};
use crate::messaging::Publisher;
use crate::model::{Content, Image};
use crate::repository::{Repository, UnitOfWork};

pub use delete::DeleteHandler;
pub use dlq::DlqHandler;
pub use new_file::NewFileHandler;
pub use process_complete::ProcessCompleteHandler;
pub use process_request::ProcessRequestHandler;
pub use processor::{HttpImageProcessor, ImageProcessor, ProcessingJob};
pub use runner::{subscription_name, HandlerRunner};
pub use upload::UploadHandler;

/// Version stamped on images entering processing
pub const PROCESSING_VERSION: &str = "v2";

// =============================================================================
// Handler Contract
// =============================================================================

/// Handles events of one kind.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable name, used in logs and subscription names
    fn name(&self) -> &'static str;

    /// The kind this handler consumes
    fn kind(&self) -> EventKind;

    async fn handle(&self, event: &Event) -> Result<(), PipelineError>;

    /// Called once an `Internal` failure has used up its delivery attempts.
    /// The message is acknowledged after this returns `Ok`.
    async fn on_exhausted(
        &self,
        event: &Event,
        error: &PipelineError,
        retry: RetryMetadata,
    ) -> Result<(), PipelineError> {
        error!(
            handler = self.name(),
            event_id = event.event_id(),
            attempts = retry.attempt_count,
            error = %error,
            "Event abandoned after exhausting retries"
        );
        Ok(())
    }
}

/// Log a payload that does not belong to the handler. Always a no-op.
fn ignore_mismatch(handler: &'static str, expected: EventKind, event: &Event) {
    warn!(
        handler,
        expected = %expected,
        received = %event.kind(),
        event_id = event.event_id(),
        "Ignoring event of unexpected kind"
    );
}

// =============================================================================
// Collaborators
// =============================================================================

/// Drops cached state for an image after it or its artifacts change.
#[async_trait]
pub trait ImageCacheInvalidator: Send + Sync {
    async fn invalidate_image(&self, image_id: &str);
}

/// Everything the handlers share.
#[derive(Clone)]
pub struct PipelineContext {
    pub images: Arc<dyn Repository<Image>>,
    pub contents: Arc<dyn Repository<Content>>,
    pub uow: Arc<dyn UnitOfWork>,
    pub publisher: Arc<dyn Publisher>,
    pub policies: RetryPolicies,
    pub cache: Option<Arc<dyn ImageCacheInvalidator>>,
    pub processing_version: String,
}

impl PipelineContext {
    pub fn new(
        images: Arc<dyn Repository<Image>>,
        contents: Arc<dyn Repository<Content>>,
        uow: Arc<dyn UnitOfWork>,
        publisher: Arc<dyn Publisher>,
        policies: RetryPolicies,
    ) -> Self {
        Self {
            images,
            contents,
            uow,
            publisher,
            policies,
            cache: None,
            processing_version: PROCESSING_VERSION.to_string(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn ImageCacheInvalidator>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_processing_version(mut self, version: impl Into<String>) -> Self {
        self.processing_version = version.into();
        self
    }

    async fn invalidate(&self, image_id: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate_image(image_id).await;
        }
    }
}
