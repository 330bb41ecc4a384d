use async_trait::async_trait;
use tracing::{debug, info};

use super::{ignore_mismatch, EventHandler, PipelineContext};
use crate::error::PipelineError;
use crate::event::{Event, EventKind, Payload};
use crate::model::Content;
use crate::repository::{Filters, Pagination};

/// Soft-deletes content for `delete` and `delete_file` events.
///
/// Removing the underlying object from storage is not done here.
pub struct DeleteHandler {
    ctx: PipelineContext,
    kind: EventKind,
}

impl DeleteHandler {
    /// Handler for user-initiated `delete` events.
    pub fn content(ctx: PipelineContext) -> Self {
        Self {
            ctx,
            kind: EventKind::Delete,
        }
    }

    /// Handler for `delete_file` events about derived artifacts.
    pub fn file(ctx: PipelineContext) -> Self {
        Self {
            ctx,
            kind: EventKind::DeleteFile,
        }
    }

    /// Find a content row, including already-deleted ones.
    async fn find_any(&self, content_id: &str) -> Result<Content, PipelineError> {
        self.ctx
            .contents
            .find_by_filters(
                &Filters::new().eq("id", content_id).include_deleted(),
                Pagination { offset: 0, limit: 1 },
            )
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::ContentNotFound(content_id.to_string()))
    }

    async fn delete(&self, content_id: &str, path: Option<&str>) -> Result<(), PipelineError> {
        let content = self.find_any(content_id).await?;
        if content.deleted_at.is_some() {
            debug!(content_id, "Content already deleted");
            return Ok(());
        }

        self.ctx.contents.soft_delete(content_id).await?;
        info!(
            content_id,
            path = path.unwrap_or(&content.path),
            "Content deleted"
        );

        if let Some(image_id) = &content.parent {
            self.ctx.invalidate(image_id).await;
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for DeleteHandler {
    fn name(&self) -> &'static str {
        match self.kind {
            EventKind::DeleteFile => "delete_file",
            _ => "delete",
        }
    }

    fn kind(&self) -> EventKind {
        self.kind
    }

    async fn handle(&self, event: &Event) -> Result<(), PipelineError> {
        match (self.kind, event.payload()) {
            (EventKind::Delete, Payload::Delete(p)) => self.delete(&p.content_id, None).await,
            (EventKind::DeleteFile, Payload::DeleteFile(p)) => {
                self.delete(&p.content_id, p.path.as_deref()).await
            }
            _ => {
                ignore_mismatch(self.name(), self.kind, event);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Delete, DeleteFile};
    use crate::pipeline::testing::Fixture;

    #[tokio::test]
    async fn test_delete_soft_deletes_and_invalidates() {
        let fx = Fixture::new();
        let content = fx.seed_content("img-1", "img-1/report.pdf").await;

        DeleteHandler::content(fx.ctx.clone())
            .handle(&Event::new(Delete {
                content_id: content.id.clone(),
            }))
            .await
            .unwrap();

        assert!(matches!(
            fx.store.contents().read(&content.id).await,
            Err(PipelineError::ContentNotFound(_))
        ));
        assert_eq!(fx.invalidated(), vec!["img-1"]);
    }

    #[tokio::test]
    async fn test_delete_twice_is_noop() {
        let fx = Fixture::new();
        let content = fx.seed_content("img-1", "img-1/thumbnail.jpg").await;
        let handler = DeleteHandler::file(fx.ctx.clone());
        let event = Event::new(DeleteFile {
            content_id: content.id.clone(),
            path: Some(content.path.clone()),
        });

        handler.handle(&event).await.unwrap();
        handler.handle(&event).await.unwrap();

        assert_eq!(fx.invalidated().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_content_is_not_found() {
        let fx = Fixture::new();
        let err = DeleteHandler::content(fx.ctx.clone())
            .handle(&Event::new(Delete {
                content_id: "missing".into(),
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ContentNotFound(_)));
    }

    #[tokio::test]
    async fn test_handlers_only_accept_their_kind() {
        let fx = Fixture::new();
        let content = fx.seed_content("img-1", "img-1/report.pdf").await;

        DeleteHandler::file(fx.ctx.clone())
            .handle(&Event::new(Delete {
                content_id: content.id.clone(),
            }))
            .await
            .unwrap();

        assert!(fx.store.contents().read(&content.id).await.is_ok());
    }
}
