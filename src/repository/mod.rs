//! Persistence boundary.
//!
//! The document store is an external collaborator reached through
//! [`Repository`]. Handlers that touch several entities at once go through
//! [`UnitOfWork::with_tx`], which hands them repositories bound to a single
//! transaction.
//!
//! ```text
//! ┌──────────────────────────────┐
//! │       Pipeline Handlers      │
//! └──────┬───────────────┬───────┘
//!        │ read/update   │ with_tx
//!        ▼               ▼
//! ┌─────────────┐  ┌─────────────┐
//! │ Repository  │  │ UnitOfWork  │──► TxContext { images, contents }
//! └──────┬──────┘  └──────┬──────┘
//!        └────────┬───────┘
//!                 ▼
//!          MemoryStore (adapter)
//! ```

mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::PipelineError;
use crate::model::{Content, Image};

pub use memory::MemoryStore;

// =============================================================================
// Entity
// =============================================================================

/// A persisted entity with partial field updates and soft deletion.
pub trait Entity: Clone + Send + Sync + 'static {
    /// One partial update understood by the entity
    type Field: Clone + Send + Sync + 'static;

    /// Entity name used in logs and errors
    const NAME: &'static str;

    fn id(&self) -> &str;

    /// Apply one field update. Refusing the update leaves `self` unusable;
    /// repositories apply updates to a copy.
    fn apply(&mut self, field: &Self::Field) -> Result<(), PipelineError>;

    /// Check invariants once a whole batch of updates has been applied.
    fn validate(&self) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Record a modification time.
    fn touch(&mut self, _at: DateTime<Utc>) {}

    fn is_deleted(&self) -> bool;

    fn mark_deleted(&mut self, at: DateTime<Utc>);

    /// The error returned when a lookup by id misses.
    fn not_found(id: &str) -> PipelineError;
}

// =============================================================================
// Queries
// =============================================================================

/// Equality filters over the entity's serialized form.
///
/// Field names may use dots to reach nested fields (`processing.status`).
#[derive(Debug, Clone, Default)]
pub struct Filters {
    pub conditions: Vec<(String, Value)>,
    pub include_deleted: bool,
}

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((field.into(), value.into()));
        self
    }

    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    /// Whether a serialized entity satisfies every condition.
    pub fn matches(&self, document: &Value) -> bool {
        self.conditions.iter().all(|(field, expected)| {
            let pointer = format!("/{}", field.replace('.', "/"));
            document.pointer(&pointer) == Some(expected)
        })
    }
}

/// Offset/limit paging for [`Repository::find_by_filters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

// =============================================================================
// Repository
// =============================================================================

/// Per-entity persistence contract.
#[async_trait]
pub trait Repository<T: Entity>: Send + Sync {
    /// Insert a new entity. Fails with `Conflict` if the id is taken.
    async fn create(&self, entity: T) -> Result<T, PipelineError>;

    /// Read a live entity. Soft-deleted entities are not found.
    async fn read(&self, id: &str) -> Result<T, PipelineError>;

    /// Apply field updates atomically and return the updated entity.
    async fn update(&self, id: &str, fields: &[T::Field]) -> Result<T, PipelineError>;

    /// Mark an entity deleted. Deleting twice is a no-op.
    async fn soft_delete(&self, id: &str) -> Result<(), PipelineError>;

    async fn find_by_filters(
        &self,
        filters: &Filters,
        pagination: Pagination,
    ) -> Result<Vec<T>, PipelineError>;

    async fn count(&self, filters: &Filters) -> Result<u64, PipelineError>;
}

// =============================================================================
// Unit of Work
// =============================================================================

/// Repository handles bound to one transaction.
#[derive(Clone)]
pub struct TxContext {
    images: Arc<dyn Repository<Image>>,
    contents: Arc<dyn Repository<Content>>,
}

impl TxContext {
    pub fn new(
        images: Arc<dyn Repository<Image>>,
        contents: Arc<dyn Repository<Content>>,
    ) -> Self {
        Self { images, contents }
    }

    pub fn images(&self) -> &dyn Repository<Image> {
        self.images.as_ref()
    }

    pub fn contents(&self) -> &dyn Repository<Content> {
        self.contents.as_ref()
    }
}

/// Work executed inside a transaction.
pub type TxWork =
    Box<dyn FnOnce(TxContext) -> BoxFuture<'static, Result<(), PipelineError>> + Send>;

/// Transactional boundary spanning several repositories.
///
/// All operations made through the [`TxContext`] observe each other's writes
/// and either all commit or all roll back. An error returned by the work
/// rolls the transaction back and is returned unchanged.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    async fn with_tx(&self, work: TxWork) -> Result<(), PipelineError>;
}
