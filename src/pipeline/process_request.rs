use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use super::{ignore_mismatch, EventHandler, ImageProcessor, PipelineContext, ProcessingJob};
use crate::error::PipelineError;
use crate::event::{Event, EventKind, ImageProcessDlq, Payload, RetryMetadata};
use crate::model::{ImageField, ProcessingStatus};

/// Moves an image into `processing` and runs the external worker.
///
/// A worker failure marks the image `failed` and is returned as `Internal`
/// so the request is redelivered. Once redeliveries run out, the request is
/// forwarded to the dead-letter flow.
pub struct ProcessRequestHandler {
    ctx: PipelineContext,
    processor: Arc<dyn ImageProcessor>,
}

impl ProcessRequestHandler {
    pub fn new(ctx: PipelineContext, processor: Arc<dyn ImageProcessor>) -> Self {
        Self { ctx, processor }
    }
}

#[async_trait]
impl EventHandler for ProcessRequestHandler {
    fn name(&self) -> &'static str {
        "process_request"
    }

    fn kind(&self) -> EventKind {
        EventKind::ImageProcessRequested
    }

    async fn handle(&self, event: &Event) -> Result<(), PipelineError> {
        let Payload::ImageProcessRequested(payload) = event.payload() else {
            ignore_mismatch(self.name(), self.kind(), event);
            return Ok(());
        };

        self.ctx
            .images
            .update(
                &payload.image_id,
                &[
                    ImageField::Status(ProcessingStatus::Processing),
                    ImageField::Version(payload.version.clone()),
                    ImageField::FailureReason(None),
                    ImageField::LastProcessedAt(Utc::now()),
                ],
            )
            .await?;
        self.ctx.invalidate(&payload.image_id).await;

        info!(
            image_id = %payload.image_id,
            content_id = %payload.content.id,
            version = %payload.version,
            "Processing image"
        );

        let job = ProcessingJob {
            image_id: payload.image_id.clone(),
            version: payload.version.clone(),
            event_id: event.event_id().to_string(),
            content: payload.content.clone(),
        };

        if let Err(e) = self.processor.process(&job).await {
            let reason = e.to_string();
            let marked = self
                .ctx
                .images
                .update(
                    &payload.image_id,
                    &[
                        ImageField::Status(ProcessingStatus::Failed),
                        ImageField::FailureReason(Some(reason)),
                    ],
                )
                .await;
            if let Err(mark_err) = marked {
                warn!(image_id = %payload.image_id, error = %mark_err, "Could not mark image failed");
            }
            self.ctx.invalidate(&payload.image_id).await;
            return Err(PipelineError::internal("image processing worker", e));
        }

        Ok(())
    }

    async fn on_exhausted(
        &self,
        event: &Event,
        error: &PipelineError,
        retry: RetryMetadata,
    ) -> Result<(), PipelineError> {
        let Payload::ImageProcessRequested(payload) = event.payload() else {
            return Ok(());
        };

        error!(
            image_id = %payload.image_id,
            event_id = event.event_id(),
            attempts = retry.attempt_count,
            error = %error,
            "Image processing retries exhausted, dead-lettering"
        );

        let dlq = Event::new(ImageProcessDlq {
            image_id: payload.image_id.clone(),
            original_event_id: event.event_id().to_string(),
            failure_reason: error.to_string(),
            retryable: error.kind().is_retryable(),
            retry,
        });
        self.ctx.publisher.publish(&dlq).await
    }
}
