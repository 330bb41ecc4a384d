use async_trait::async_trait;
use tracing::{debug, info};

use super::{ignore_mismatch, EventHandler, PipelineContext};
use crate::error::PipelineError;
use crate::event::{Event, EventKind, ImageProcessRequested, Payload};

/// Requests processing for newly uploaded slide images.
///
/// Thumbnails and non-image uploads are ignored.
pub struct UploadHandler {
    ctx: PipelineContext,
}

impl UploadHandler {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl EventHandler for UploadHandler {
    fn name(&self) -> &'static str {
        "upload"
    }

    fn kind(&self) -> EventKind {
        EventKind::Uploaded
    }

    async fn handle(&self, event: &Event) -> Result<(), PipelineError> {
        let Payload::Uploaded(payload) = event.payload() else {
            ignore_mismatch(self.name(), self.kind(), event);
            return Ok(());
        };

        // The stored row is authoritative over the event copy
        let content = self.ctx.contents.read(&payload.content.id).await?;

        if !content.content_type.is_image() || content.content_type.is_thumbnail() {
            debug!(
                content_id = %content.id,
                path = %content.path,
                "Upload is not a slide image, skipping"
            );
            return Ok(());
        }

        let image_id = content.parent.clone().ok_or_else(|| {
            PipelineError::Validation(format!("content {} has no parent image", content.id))
        })?;

        info!(
            image_id = %image_id,
            content_id = %content.id,
            version = %self.ctx.processing_version,
            "Requesting image processing"
        );

        let request = Event::new(ImageProcessRequested {
            image_id,
            content,
            version: self.ctx.processing_version.clone(),
        });
        self.ctx.publisher.publish(&request).await
    }
}
