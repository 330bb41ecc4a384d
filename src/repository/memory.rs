//! In-memory document store.
//!
//! Implements [`Repository`] for images and contents and [`UnitOfWork`] on
//! top of a snapshot-and-replay scheme:
//!
//! - A transaction starts from a snapshot of the live tables and records
//!   every write it makes in a log
//! - Reads inside the transaction see the snapshot plus its own writes
//! - Commit replays the log against a copy of the live tables and swaps the
//!   copy in only if every operation succeeds
//!
//! Transactions are serialized by an async gate. Writes made outside a
//! transaction go straight to the live tables, and are never lost by a
//! concurrent commit because commit replays operations instead of
//! overwriting rows.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use super::{Entity, Filters, Pagination, Repository, TxContext, TxWork, UnitOfWork};
use crate::error::PipelineError;
use crate::model::{Content, ContentField, Image, ImageField};

// =============================================================================
// Tables
// =============================================================================

#[derive(Debug, Clone, Default)]
struct Tables {
    images: HashMap<String, Image>,
    contents: HashMap<String, Content>,
}

/// Entities the in-memory store knows how to hold.
trait Stored: Entity + Serialize {
    fn table(tables: &Tables) -> &HashMap<String, Self>;
    fn table_mut(tables: &mut Tables) -> &mut HashMap<String, Self>;
    fn create_op(entity: Self) -> TxOp;
    fn update_op(id: String, fields: Vec<Self::Field>) -> TxOp;
    fn delete_op(id: String) -> TxOp;
}

impl Stored for Image {
    fn table(tables: &Tables) -> &HashMap<String, Self> {
        &tables.images
    }
    fn table_mut(tables: &mut Tables) -> &mut HashMap<String, Self> {
        &mut tables.images
    }
    fn create_op(entity: Self) -> TxOp {
        TxOp::CreateImage(entity)
    }
    fn update_op(id: String, fields: Vec<ImageField>) -> TxOp {
        TxOp::UpdateImage(id, fields)
    }
    fn delete_op(id: String) -> TxOp {
        TxOp::DeleteImage(id)
    }
}

impl Stored for Content {
    fn table(tables: &Tables) -> &HashMap<String, Self> {
        &tables.contents
    }
    fn table_mut(tables: &mut Tables) -> &mut HashMap<String, Self> {
        &mut tables.contents
    }
    fn create_op(entity: Self) -> TxOp {
        TxOp::CreateContent(entity)
    }
    fn update_op(id: String, fields: Vec<ContentField>) -> TxOp {
        TxOp::UpdateContent(id, fields)
    }
    fn delete_op(id: String) -> TxOp {
        TxOp::DeleteContent(id)
    }
}

/// A write recorded by a transaction, replayed on commit.
#[derive(Debug, Clone)]
enum TxOp {
    CreateImage(Image),
    CreateContent(Content),
    UpdateImage(String, Vec<ImageField>),
    UpdateContent(String, Vec<ContentField>),
    DeleteImage(String),
    DeleteContent(String),
}

impl TxOp {
    fn replay(self, tables: &mut Tables) -> Result<(), PipelineError> {
        match self {
            TxOp::CreateImage(image) => create_in(tables, image).map(|_| ()),
            TxOp::CreateContent(content) => create_in(tables, content).map(|_| ()),
            TxOp::UpdateImage(id, fields) => update_in::<Image>(tables, &id, &fields).map(|_| ()),
            TxOp::UpdateContent(id, fields) => {
                update_in::<Content>(tables, &id, &fields).map(|_| ())
            }
            TxOp::DeleteImage(id) => delete_in::<Image>(tables, &id),
            TxOp::DeleteContent(id) => delete_in::<Content>(tables, &id),
        }
    }
}

// =============================================================================
// Table Operations
// =============================================================================

fn create_in<T: Stored>(tables: &mut Tables, entity: T) -> Result<T, PipelineError> {
    let table = T::table_mut(tables);
    if table.contains_key(entity.id()) {
        return Err(PipelineError::Conflict(format!(
            "{} {} already exists",
            T::NAME,
            entity.id()
        )));
    }
    entity.validate()?;
    table.insert(entity.id().to_string(), entity.clone());
    Ok(entity)
}

fn read_in<T: Stored>(tables: &Tables, id: &str) -> Result<T, PipelineError> {
    T::table(tables)
        .get(id)
        .filter(|entity| !entity.is_deleted())
        .cloned()
        .ok_or_else(|| T::not_found(id))
}

fn update_in<T: Stored>(
    tables: &mut Tables,
    id: &str,
    fields: &[T::Field],
) -> Result<T, PipelineError> {
    let current = read_in::<T>(tables, id)?;

    // Apply to a copy so a refused update leaves the row untouched
    let mut updated = current;
    for field in fields {
        updated.apply(field)?;
    }
    updated.validate()?;
    updated.touch(Utc::now());

    T::table_mut(tables).insert(id.to_string(), updated.clone());
    Ok(updated)
}

fn delete_in<T: Stored>(tables: &mut Tables, id: &str) -> Result<(), PipelineError> {
    let entity = T::table_mut(tables)
        .get_mut(id)
        .ok_or_else(|| T::not_found(id))?;
    if !entity.is_deleted() {
        entity.mark_deleted(Utc::now());
    }
    Ok(())
}

fn find_in<T: Stored>(
    tables: &Tables,
    filters: &Filters,
) -> Result<Vec<T>, PipelineError> {
    let mut found = Vec::new();
    for entity in T::table(tables).values() {
        if entity.is_deleted() && !filters.include_deleted {
            continue;
        }
        let document = serde_json::to_value(entity)
            .map_err(|e| PipelineError::internal("serialize entity for filtering", e))?;
        if filters.matches(&document) {
            found.push(entity.clone());
        }
    }
    // HashMap order is arbitrary; page over a stable order
    found.sort_by(|a, b| a.id().cmp(b.id()));
    Ok(found)
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, PipelineError> {
    mutex
        .lock()
        .map_err(|_| PipelineError::internal("memory store", "lock poisoned"))
}

// =============================================================================
// MemoryStore
// =============================================================================

struct StoreState {
    tables: Mutex<Tables>,
    tx_gate: tokio::sync::Mutex<()>,
}

/// In-memory adapter for the document store.
///
/// Cloning is cheap; clones share the same tables.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(StoreState {
                tables: Mutex::new(Tables::default()),
                tx_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Repository for images, operating outside any transaction.
    pub fn images(&self) -> Arc<dyn Repository<Image>> {
        Arc::new(MemoryRepository::<Image>::new(self.state.clone()))
    }

    /// Repository for contents, operating outside any transaction.
    pub fn contents(&self) -> Arc<dyn Repository<Content>> {
        Arc::new(MemoryRepository::<Content>::new(self.state.clone()))
    }

    fn commit(&self, log: Vec<TxOp>) -> Result<(), PipelineError> {
        let mut live = lock(&self.state.tables)?;
        let mut working = live.clone();
        for op in log {
            op.replay(&mut working)?;
        }
        *live = working;
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UnitOfWork for MemoryStore {
    async fn with_tx(&self, work: TxWork) -> Result<(), PipelineError> {
        let _gate = self.state.tx_gate.lock().await;

        let snapshot = lock(&self.state.tables)?.clone();
        let tx = Arc::new(Mutex::new(TxState {
            tables: snapshot,
            log: Vec::new(),
            open: true,
        }));

        let ctx = TxContext::new(
            Arc::new(TxRepository::<Image>::new(tx.clone())),
            Arc::new(TxRepository::<Content>::new(tx.clone())),
        );

        let result = work(ctx).await;

        let log = {
            let mut state = lock(&tx)?;
            state.open = false;
            std::mem::take(&mut state.log)
        };

        match result {
            Ok(()) => {
                let ops = log.len();
                self.commit(log)?;
                debug!(ops, "Transaction committed");
                Ok(())
            }
            Err(e) => {
                debug!(ops = log.len(), error = %e, "Transaction rolled back");
                Err(e)
            }
        }
    }
}

// =============================================================================
// Live Repository
// =============================================================================

struct MemoryRepository<T> {
    state: Arc<StoreState>,
    _entity: PhantomData<fn() -> T>,
}

impl<T> MemoryRepository<T> {
    fn new(state: Arc<StoreState>) -> Self {
        Self {
            state,
            _entity: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Stored> Repository<T> for MemoryRepository<T> {
    async fn create(&self, entity: T) -> Result<T, PipelineError> {
        create_in(&mut *lock(&self.state.tables)?, entity)
    }

    async fn read(&self, id: &str) -> Result<T, PipelineError> {
        read_in(&*lock(&self.state.tables)?, id)
    }

    async fn update(&self, id: &str, fields: &[T::Field]) -> Result<T, PipelineError> {
        update_in(&mut *lock(&self.state.tables)?, id, fields)
    }

    async fn soft_delete(&self, id: &str) -> Result<(), PipelineError> {
        delete_in::<T>(&mut *lock(&self.state.tables)?, id)
    }

    async fn find_by_filters(
        &self,
        filters: &Filters,
        pagination: Pagination,
    ) -> Result<Vec<T>, PipelineError> {
        let found = find_in::<T>(&*lock(&self.state.tables)?, filters)?;
        Ok(found
            .into_iter()
            .skip(pagination.offset)
            .take(pagination.limit)
            .collect())
    }

    async fn count(&self, filters: &Filters) -> Result<u64, PipelineError> {
        Ok(find_in::<T>(&*lock(&self.state.tables)?, filters)?.len() as u64)
    }
}

// =============================================================================
// Transaction Repository
// =============================================================================

struct TxState {
    tables: Tables,
    log: Vec<TxOp>,
    open: bool,
}

impl TxState {
    fn ensure_open(&self) -> Result<(), PipelineError> {
        if self.open {
            Ok(())
        } else {
            Err(PipelineError::internal(
                "memory store",
                "transaction already finished",
            ))
        }
    }
}

struct TxRepository<T> {
    tx: Arc<Mutex<TxState>>,
    _entity: PhantomData<fn() -> T>,
}

impl<T> TxRepository<T> {
    fn new(tx: Arc<Mutex<TxState>>) -> Self {
        Self {
            tx,
            _entity: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Stored> Repository<T> for TxRepository<T> {
    async fn create(&self, entity: T) -> Result<T, PipelineError> {
        let mut tx = lock(&self.tx)?;
        tx.ensure_open()?;
        let created = create_in(&mut tx.tables, entity)?;
        tx.log.push(T::create_op(created.clone()));
        Ok(created)
    }

    async fn read(&self, id: &str) -> Result<T, PipelineError> {
        let tx = lock(&self.tx)?;
        tx.ensure_open()?;
        read_in(&tx.tables, id)
    }

    async fn update(&self, id: &str, fields: &[T::Field]) -> Result<T, PipelineError> {
        let mut tx = lock(&self.tx)?;
        tx.ensure_open()?;
        let updated = update_in(&mut tx.tables, id, fields)?;
        tx.log.push(T::update_op(id.to_string(), fields.to_vec()));
        Ok(updated)
    }

    async fn soft_delete(&self, id: &str) -> Result<(), PipelineError> {
        let mut tx = lock(&self.tx)?;
        tx.ensure_open()?;
        delete_in::<T>(&mut tx.tables, id)?;
        tx.log.push(T::delete_op(id.to_string()));
        Ok(())
    }

    async fn find_by_filters(
        &self,
        filters: &Filters,
        pagination: Pagination,
    ) -> Result<Vec<T>, PipelineError> {
        let tx = lock(&self.tx)?;
        tx.ensure_open()?;
        Ok(find_in::<T>(&tx.tables, filters)?
            .into_iter()
            .skip(pagination.offset)
            .take(pagination.limit)
            .collect())
    }

    async fn count(&self, filters: &Filters) -> Result<u64, PipelineError> {
        let tx = lock(&self.tx)?;
        tx.ensure_open()?;
        Ok(find_in::<T>(&tx.tables, filters)?.len() as u64)
    }
}
