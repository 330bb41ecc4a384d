use async_trait::async_trait;
use tracing::error;

use super::{ignore_mismatch, EventHandler, PipelineContext};
use crate::error::PipelineError;
use crate::event::{Event, EventKind, Payload};
use crate::model::{ImageField, ProcessingStatus};

/// Terminal failure sink: marks the image `failed_permanent` and raises an
/// alert. Never requests further processing.
pub struct DlqHandler {
    ctx: PipelineContext,
}

impl DlqHandler {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl EventHandler for DlqHandler {
    fn name(&self) -> &'static str {
        "dlq"
    }

    fn kind(&self) -> EventKind {
        EventKind::ImageProcessDlq
    }

    async fn handle(&self, event: &Event) -> Result<(), PipelineError> {
        let Payload::ImageProcessDlq(payload) = event.payload() else {
            ignore_mismatch(self.name(), self.kind(), event);
            return Ok(());
        };

        let policy = self.ctx.policies.for_kind(EventKind::ImageProcessRequested);
        error!(
            alert = "image_processing_failed",
            image_id = %payload.image_id,
            original_event_id = %payload.original_event_id,
            reason = %payload.failure_reason,
            retryable = payload.retryable,
            attempt_count = payload.retry.attempt_count,
            max_attempts = payload.retry.max_attempts,
            first_attempt_at = %payload.retry.first_attempt_at,
            last_attempt_at = %payload.retry.last_attempt_at,
            policy_max_attempts = policy.max_attempts(),
            policy_base_backoff_ms = policy.base_backoff().as_millis() as u64,
            policy_max_backoff_ms = policy.max_backoff().as_millis() as u64,
            policy_multiplier = policy.multiplier(),
            "Image processing permanently failed"
        );

        self.ctx
            .images
            .update(
                &payload.image_id,
                &[
                    ImageField::Status(ProcessingStatus::FailedPermanent),
                    ImageField::FailureReason(Some(payload.failure_reason.clone())),
                    ImageField::RetryCount(payload.retry.attempt_count),
                ],
            )
            .await?;
        self.ctx.invalidate(&payload.image_id).await;
        Ok(())
    }
}
