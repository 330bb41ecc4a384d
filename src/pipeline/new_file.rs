use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{ignore_mismatch, EventHandler, PipelineContext};
use crate::error::PipelineError;
use crate::event::{Event, EventKind, ImageProcessRequested, Payload};
use crate::model::{Content, ContentCategory, ImageField, ProcessingStatus};
use crate::repository::TxContext;

/// Registers a produced artifact against its image.
///
/// Inside one transaction the content row is created and exactly one image
/// pointer is repointed according to the content's category. A new origin
/// also restarts processing; its `image_process_requested` event is only
/// published once the transaction has committed. After commit, an image whose mandatory
/// artifacts are all present is promoted to `processed`; that step runs
/// outside the transaction and tolerates concurrent promotions.
pub struct NewFileHandler {
    ctx: PipelineContext,
}

impl NewFileHandler {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    /// Promote the image if every mandatory artifact is registered.
    async fn promote_if_complete(&self, image_id: &str) -> Result<(), PipelineError> {
        let image = self.ctx.images.read(image_id).await?;

        if !image.has_mandatory_artifacts() {
            debug!(
                image_id,
                missing = ?image.missing_artifacts(),
                "Image still waiting for artifacts"
            );
            return Ok(());
        }
        if image.status() == ProcessingStatus::Processed {
            return Ok(());
        }
        if !image.status().can_transition_to(ProcessingStatus::Processed) {
            info!(
                image_id,
                status = %image.status(),
                "Artifacts complete but image cannot be promoted from its current status"
            );
            return Ok(());
        }

        match self
            .ctx
            .images
            .update(image_id, &[ImageField::Status(ProcessingStatus::Processed)])
            .await
        {
            Ok(_) => {
                info!(image_id, "Image processed");
                self.ctx.invalidate(image_id).await;
                Ok(())
            }
            // Lost a race with another writer; the image converges on its own
            Err(PipelineError::Conflict(reason)) => {
                info!(image_id, reason = %reason, "Skipping promotion");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Image pointer updates for a newly registered content.
fn repoint(content_id: &str, category: ContentCategory, version: &str) -> Vec<ImageField> {
    let id = content_id.to_string();
    match category {
        ContentCategory::Thumbnail => vec![ImageField::ThumbnailContent(id)],
        ContentCategory::Dzi => vec![ImageField::DziContent(id)],
        ContentCategory::IndexMap => vec![ImageField::IndexMapContent(id)],
        ContentCategory::Archive => vec![ImageField::ZipTilesContent(id)],
        ContentCategory::Tiles => vec![ImageField::TilesContent(id)],
        ContentCategory::Image => vec![
            ImageField::OriginContent(id),
            ImageField::Status(ProcessingStatus::Processing),
            ImageField::Version(version.to_string()),
            ImageField::FailureReason(None),
        ],
        ContentCategory::Document | ContentCategory::Other => Vec::new(),
    }
}

/// Create the content, or return the existing row on redelivery.
async fn create_or_existing(tx: &TxContext, content: Content) -> Result<Content, PipelineError> {
    let id = content.id.clone();
    match tx.contents().create(content).await {
        Ok(created) => Ok(created),
        Err(PipelineError::Conflict(_)) => tx.contents().read(&id).await,
        Err(e) => Err(e),
    }
}

#[async_trait]
impl EventHandler for NewFileHandler {
    fn name(&self) -> &'static str {
        "new_file"
    }

    fn kind(&self) -> EventKind {
        EventKind::NewFileExist
    }

    async fn handle(&self, event: &Event) -> Result<(), PipelineError> {
        let Payload::NewFileExist(payload) = event.payload() else {
            ignore_mismatch(self.name(), self.kind(), event);
            return Ok(());
        };

        let content = payload.content.clone();
        let image_id = content.parent.clone().ok_or_else(|| {
            PipelineError::Validation(format!("content {} has no parent image", content.id))
        })?;
        let category = content.content_type.category();
        let is_origin = category == ContentCategory::Image;

        let version = self.ctx.processing_version.clone();
        let tx_image_id = image_id.clone();
        let requested: Arc<Mutex<Option<ImageProcessRequested>>> = Arc::new(Mutex::new(None));
        let tx_requested = requested.clone();

        self.ctx
            .uow
            .with_tx(Box::new(move |tx| {
                Box::pin(async move {
                    tx.images().read(&tx_image_id).await?;

                    let created = create_or_existing(&tx, content).await?;
                    let fields = repoint(&created.id, category, &version);
                    if fields.is_empty() {
                        debug!(
                            image_id = %tx_image_id,
                            content_id = %created.id,
                            "Content registered without an image pointer"
                        );
                        return Ok(());
                    }
                    tx.images().update(&tx_image_id, &fields).await?;

                    if is_origin {
                        *tx_requested.lock().unwrap_or_else(PoisonError::into_inner) =
                            Some(ImageProcessRequested {
                                image_id: tx_image_id,
                                content: created,
                                version,
                            });
                    }
                    Ok(())
                })
            }))
            .await?;

        let request = requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(request) = request {
            self.ctx.publisher.publish(&Event::new(request)).await?;
        }

        debug!(image_id = %image_id, category = ?category, "Registered artifact");
        self.ctx.invalidate(&image_id).await;

        if is_origin || matches!(category, ContentCategory::Document | ContentCategory::Other) {
            return Ok(());
        }

        if let Err(e) = self.promote_if_complete(&image_id).await {
            warn!(image_id = %image_id, error = %e, "Promotion check failed");
            return Err(e);
        }
        Ok(())
    }
}
