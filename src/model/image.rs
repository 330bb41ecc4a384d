//! Image aggregate and its processing state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::repository::Entity;

// =============================================================================
// Processing Status
// =============================================================================

/// Lifecycle of an image through the derivative pipeline.
///
/// ```text
/// pending ──► processing ──► processed
///                 │  ▲           │
///                 ▼  │           │ (new origin)
///               failed ◄─────────┘
///                 │
///                 ▼
///          failed_permanent
///
/// any non-terminal state ──► deleting
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Processed,
    Failed,
    FailedPermanent,
    Deleting,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Processed => "processed",
            ProcessingStatus::Failed => "failed",
            ProcessingStatus::FailedPermanent => "failed_permanent",
            ProcessingStatus::Deleting => "deleting",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingStatus::Deleting)
    }

    /// Whether `self → next` is a legal transition.
    ///
    /// Moving to the current status is always allowed so that redelivered
    /// events stay no-ops.
    pub fn can_transition_to(&self, next: ProcessingStatus) -> bool {
        use ProcessingStatus::*;

        if *self == next {
            return true;
        }
        if next == Deleting {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Processed)
                | (Processing, Failed)
                | (Processing, FailedPermanent)
                | (Failed, Processing)
                | (Failed, FailedPermanent)
                | (Processed, Processing)
        )
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing bookkeeping embedded in an [`Image`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Processing {
    pub status: ProcessingStatus,

    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub failure_reason: Option<String>,

    #[serde(default)]
    pub last_processed_at: Option<DateTime<Utc>>,
}

impl Default for Processing {
    fn default() -> Self {
        Self {
            status: ProcessingStatus::Pending,
            version: None,
            retry_count: 0,
            failure_reason: None,
            last_processed_at: None,
        }
    }
}

// =============================================================================
// Image
// =============================================================================

/// Aggregate root for one slide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,

    /// Owning patient
    pub parent: Option<String>,

    pub name: String,

    pub origin_content_id: Option<String>,
    pub thumbnail_content_id: Option<String>,
    pub dzi_content_id: Option<String>,
    pub indexmap_content_id: Option<String>,
    pub tiles_content_id: Option<String>,
    pub zip_tiles_content_id: Option<String>,

    pub processing: Processing,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Image {
    /// Register a new image in `pending` state.
    pub fn new(name: impl Into<String>, parent: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            parent,
            name: name.into(),
            origin_content_id: None,
            thumbnail_content_id: None,
            dzi_content_id: None,
            indexmap_content_id: None,
            tiles_content_id: None,
            zip_tiles_content_id: None,
            processing: Processing::default(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Same as [`Image::new`] with a caller-chosen id.
    pub fn with_id(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::new(name, None)
        }
    }

    pub fn status(&self) -> ProcessingStatus {
        self.processing.status
    }

    /// True once thumbnail, DZI, index map and one tile store are all set.
    pub fn has_mandatory_artifacts(&self) -> bool {
        self.thumbnail_content_id.is_some()
            && self.dzi_content_id.is_some()
            && self.indexmap_content_id.is_some()
            && (self.tiles_content_id.is_some() || self.zip_tiles_content_id.is_some())
    }

    /// Names of the mandatory artifacts that are still missing.
    pub fn missing_artifacts(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.thumbnail_content_id.is_none() {
            missing.push("thumbnail");
        }
        if self.dzi_content_id.is_none() {
            missing.push("dzi");
        }
        if self.indexmap_content_id.is_none() {
            missing.push("indexmap");
        }
        if self.tiles_content_id.is_none() && self.zip_tiles_content_id.is_none() {
            missing.push("tiles");
        }
        missing
    }

    fn set_status(&mut self, next: ProcessingStatus) -> Result<(), PipelineError> {
        let current = self.processing.status;
        if !current.can_transition_to(next) {
            return Err(PipelineError::Conflict(format!(
                "image {} cannot move from {} to {}",
                self.id, current, next
            )));
        }
        if current == next {
            return Ok(());
        }
        self.processing.status = next;
        Ok(())
    }

    /// Check the per-status invariants after a batch of updates.
    fn check_invariants(&self) -> Result<(), PipelineError> {
        match self.processing.status {
            ProcessingStatus::Processing if self.processing.version.is_none() => {
                Err(PipelineError::Conflict(format!(
                    "image {} cannot be processing without a version",
                    self.id
                )))
            }
            ProcessingStatus::Processed if !self.has_mandatory_artifacts() => {
                Err(PipelineError::Conflict(format!(
                    "image {} cannot be processed, missing: {}",
                    self.id,
                    self.missing_artifacts().join(", ")
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Field updates accepted by the image repository.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageField {
    OriginContent(String),
    ThumbnailContent(String),
    DziContent(String),
    IndexMapContent(String),
    TilesContent(String),
    ZipTilesContent(String),
    Status(ProcessingStatus),
    Version(String),
    RetryCount(u32),
    FailureReason(Option<String>),
    LastProcessedAt(DateTime<Utc>),
}

impl Entity for Image {
    type Field = ImageField;

    const NAME: &'static str = "image";

    fn id(&self) -> &str {
        &self.id
    }

    fn apply(&mut self, field: &ImageField) -> Result<(), PipelineError> {
        match field {
            ImageField::OriginContent(id) => self.origin_content_id = Some(id.clone()),
            ImageField::ThumbnailContent(id) => self.thumbnail_content_id = Some(id.clone()),
            ImageField::DziContent(id) => self.dzi_content_id = Some(id.clone()),
            ImageField::IndexMapContent(id) => self.indexmap_content_id = Some(id.clone()),
            ImageField::TilesContent(id) => self.tiles_content_id = Some(id.clone()),
            ImageField::ZipTilesContent(id) => self.zip_tiles_content_id = Some(id.clone()),
            ImageField::Status(status) => self.set_status(*status)?,
            ImageField::Version(version) => self.processing.version = Some(version.clone()),
            ImageField::RetryCount(count) => self.processing.retry_count = *count,
            ImageField::FailureReason(reason) => self.processing.failure_reason = reason.clone(),
            ImageField::LastProcessedAt(at) => self.processing.last_processed_at = Some(*at),
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), PipelineError> {
        self.check_invariants()
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }

    fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    fn mark_deleted(&mut self, at: DateTime<Utc>) {
        self.deleted_at = Some(at);
    }

    fn not_found(id: &str) -> PipelineError {
        PipelineError::ImageEntityNotFound(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply_all(image: &mut Image, fields: &[ImageField]) -> Result<(), PipelineError> {
        for field in fields {
            image.apply(field)?;
        }
        image.validate()
    }

    #[test]
    fn test_happy_path_transitions() {
        use ProcessingStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Processed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Processing));
        assert!(Failed.can_transition_to(FailedPermanent));
        assert!(Processing.can_transition_to(FailedPermanent));
    }

    #[test]
    fn test_illegal_transitions() {
        use ProcessingStatus::*;
        assert!(!Pending.can_transition_to(Processed));
        assert!(!FailedPermanent.can_transition_to(Processing));
        assert!(!Deleting.can_transition_to(Processing));
        assert!(!Deleting.can_transition_to(Pending));
    }

    #[test]
    fn test_self_transition_is_allowed() {
        use ProcessingStatus::*;
        for status in [Pending, Processing, Processed, Failed, FailedPermanent, Deleting] {
            assert!(status.can_transition_to(status));
        }
    }

    #[test]
    fn test_any_non_terminal_can_delete() {
        use ProcessingStatus::*;
        for status in [Pending, Processing, Processed, Failed, FailedPermanent] {
            assert!(status.can_transition_to(Deleting));
        }
    }

    #[test]
    fn test_processing_requires_version() {
        let mut image = Image::with_id("img", "slide");
        let result = apply_all(&mut image, &[ImageField::Status(ProcessingStatus::Processing)]);
        assert!(matches!(result, Err(PipelineError::Conflict(_))));

        let mut image = Image::with_id("img", "slide");
        apply_all(
            &mut image,
            &[
                ImageField::Status(ProcessingStatus::Processing),
                ImageField::Version("v2".into()),
            ],
        )
        .unwrap();
        assert_eq!(image.status(), ProcessingStatus::Processing);
    }

    #[test]
    fn test_processed_requires_all_mandatory_artifacts() {
        let mut image = Image::with_id("img", "slide");
        apply_all(
            &mut image,
            &[
                ImageField::Status(ProcessingStatus::Processing),
                ImageField::Version("v2".into()),
                ImageField::ThumbnailContent("t".into()),
                ImageField::DziContent("d".into()),
                ImageField::IndexMapContent("i".into()),
            ],
        )
        .unwrap();

        let mut three_of_four = image.clone();
        let result = apply_all(
            &mut three_of_four,
            &[ImageField::Status(ProcessingStatus::Processed)],
        );
        assert!(matches!(result, Err(PipelineError::Conflict(_))));
        assert_eq!(image.missing_artifacts(), vec!["tiles"]);

        apply_all(
            &mut image,
            &[
                ImageField::ZipTilesContent("z".into()),
                ImageField::Status(ProcessingStatus::Processed),
            ],
        )
        .unwrap();
        assert_eq!(image.status(), ProcessingStatus::Processed);
    }

    #[test]
    fn test_tiles_directory_satisfies_tile_requirement() {
        let mut image = Image::with_id("img", "slide");
        image.thumbnail_content_id = Some("t".into());
        image.dzi_content_id = Some("d".into());
        image.indexmap_content_id = Some("i".into());
        assert!(!image.has_mandatory_artifacts());
        image.tiles_content_id = Some("dir".into());
        assert!(image.has_mandatory_artifacts());
    }

    #[test]
    fn test_status_serde_names() {
        let json = serde_json::to_string(&ProcessingStatus::FailedPermanent).unwrap();
        assert_eq!(json, "\"failed_permanent\"");
    }
}
