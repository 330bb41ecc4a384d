use async_trait::async_trait;
use tracing::{info, warn};

use super::{ignore_mismatch, EventHandler, PipelineContext};
use crate::error::PipelineError;
use crate::event::{Event, EventKind, ImageProcessDlq, NewFileExist, Payload};

/// Fans a worker's result out into per-artifact registrations, or into a
/// single dead-letter event when the worker failed.
pub struct ProcessCompleteHandler {
    ctx: PipelineContext,
}

impl ProcessCompleteHandler {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl EventHandler for ProcessCompleteHandler {
    fn name(&self) -> &'static str {
        "process_complete"
    }

    fn kind(&self) -> EventKind {
        EventKind::ImageProcessCompleted
    }

    async fn handle(&self, event: &Event) -> Result<(), PipelineError> {
        let Payload::ImageProcessCompleted(payload) = event.payload() else {
            ignore_mismatch(self.name(), self.kind(), event);
            return Ok(());
        };

        if payload.version != self.ctx.processing_version {
            warn!(
                image_id = %payload.image_id,
                reported = %payload.version,
                expected = %self.ctx.processing_version,
                "Worker reported a different processing version"
            );
        }

        if !payload.success {
            let retry = payload.retry.clone().unwrap_or_else(|| {
                self.ctx
                    .policies
                    .for_kind(EventKind::ImageProcessCompleted)
                    .first_attempt()
            });
            let failure_reason = payload
                .failure_reason
                .clone()
                .unwrap_or_else(|| "worker reported failure without a reason".to_string());

            warn!(
                image_id = %payload.image_id,
                reason = %failure_reason,
                retryable = payload.retryable,
                "Image processing failed"
            );

            let dlq = Event::new(ImageProcessDlq {
                image_id: payload.image_id.clone(),
                original_event_id: event.event_id().to_string(),
                failure_reason,
                retryable: payload.retryable,
                retry,
            });
            return self.ctx.publisher.publish(&dlq).await;
        }

        if payload.contents.is_empty() {
            warn!(image_id = %payload.image_id, "Worker succeeded without producing artifacts");
        }

        for content in &payload.contents {
            let mut content = content.clone();
            content.parent = Some(payload.image_id.clone());
            self.ctx
                .publisher
                .publish(&Event::new(NewFileExist { content }))
                .await?;
        }

        info!(
            image_id = %payload.image_id,
            artifacts = payload.contents.len(),
            "Image processing completed"
        );
        Ok(())
    }
}
