//! Generic CRUD repository.
//!
//! # Responsibility
//! - Map typed entities to documents and delegate identity resolution,
//!   tracking and commit to a `PersistenceContext`.
//! - Return inserted entities as persisted, with generated keys filled.
//!
//! # Invariants
//! - `find` validates key shape before the context is touched.
//! - `insert`, `update` and `delete` stage exactly one change, then commit.

use super::batch::Batch;
use super::{RepoError, RepoResult};
use crate::context::{CommitReport, PersistenceContext, TrackMode, TrackTicket};
use crate::model::entity::{from_document, to_document, Entity};
use crate::model::key::EntityKey;
use log::{debug, info, warn};
use std::marker::PhantomData;
use std::time::Instant;

/// CRUD contract over one entity type.
pub trait Repository<T: Entity> {
    fn get_all(&mut self) -> RepoResult<Vec<T>>;
    fn find(&mut self, key: EntityKey) -> RepoResult<Option<T>>;
    fn insert(&mut self, entity: T) -> RepoResult<T>;
    fn update(&mut self, entity: &T) -> RepoResult<()>;
    fn delete(&mut self, entity: &T) -> RepoResult<()>;
}

/// Repository for entities of type `T` over context `C`.
///
/// `C` may be an owned context or `&mut` to one, so several repositories can
/// work against the same unit of work one after another.
#[derive(Debug)]
pub struct GenericRepository<C, T> {
    context: C,
    _entity: PhantomData<fn() -> T>,
}

impl<C, T> GenericRepository<C, T>
where
    C: PersistenceContext,
    T: Entity,
{
    pub fn new(context: C) -> Self {
        Self {
            context,
            _entity: PhantomData,
        }
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    pub fn into_context(self) -> C {
        self.context
    }

    /// Returns every persisted `T` in store order.
    ///
    /// Instances already tracked by the context are returned as tracked.
    pub fn get_all(&mut self) -> RepoResult<Vec<T>> {
        let started_at = Instant::now();
        let result = self
            .context
            .materialize_all(T::entity_type())
            .map_err(RepoError::from)
            .and_then(|documents| {
                documents
                    .into_iter()
                    .map(|document| from_document::<T>(document).map_err(RepoError::from))
                    .collect::<RepoResult<Vec<T>>>()
            });

        match &result {
            Ok(entities) => debug!(
                "event=repo_get_all module=repo status=ok entity={} count={} duration_ms={}",
                T::NAME,
                entities.len(),
                started_at.elapsed().as_millis()
            ),
            Err(err) => log_failure("get_all", T::NAME, started_at, err),
        }
        result
    }

    /// Finds one `T` by identity key.
    ///
    /// Returns `Ok(None)` when nothing matches, including entities pending
    /// removal in this context.
    ///
    /// # Errors
    /// - `InvalidKeyShape` when `key` does not match `T`'s key fields.
    pub fn find(&mut self, key: impl Into<EntityKey>) -> RepoResult<Option<T>> {
        let started_at = Instant::now();
        let key = key.into();
        let result = self.find_by_key(&key);

        match &result {
            Ok(found) => debug!(
                "event=repo_find module=repo status=ok entity={} found={} duration_ms={}",
                T::NAME,
                found.is_some(),
                started_at.elapsed().as_millis()
            ),
            Err(err) => log_failure("find", T::NAME, started_at, err),
        }
        result
    }

    /// Inserts `entity` and returns it as persisted.
    ///
    /// Unset generated key fields are filled by the store.
    ///
    /// # Errors
    /// - `ConstraintViolation` when the identity already exists.
    pub fn insert(&mut self, entity: T) -> RepoResult<T> {
        let started_at = Instant::now();
        let result = self.insert_inner(&entity);
        log_mutation("insert", T::NAME, started_at, &result);
        result
    }

    /// Replaces the stored state of `entity`.
    ///
    /// # Errors
    /// - `InvalidKeyShape` when the key of `entity` is unset.
    /// - `NotFound` when no stored entity has that key.
    pub fn update(&mut self, entity: &T) -> RepoResult<()> {
        let started_at = Instant::now();
        let result = self.stage_and_commit(entity, TrackMode::Modified).map(|_| ());
        log_mutation("update", T::NAME, started_at, &result);
        result
    }

    /// Deletes `entity` by its identity key.
    ///
    /// # Errors
    /// - `NotFound` when the identity no longer exists.
    pub fn delete(&mut self, entity: &T) -> RepoResult<()> {
        let started_at = Instant::now();
        let result = self.stage_and_commit(entity, TrackMode::Removed).map(|_| ());
        log_mutation("delete", T::NAME, started_at, &result);
        result
    }

    /// Opens a scope that stages changes until `Batch::commit`.
    pub fn batch(&mut self) -> Batch<'_, C, T> {
        Batch::new(self)
    }

    pub(crate) fn stage(&mut self, entity: &T, mode: TrackMode) -> RepoResult<TrackTicket> {
        let document = to_document(entity)?;
        Ok(self.context.track(T::entity_type(), document, mode)?)
    }

    pub(crate) fn withdraw(&mut self, ticket: TrackTicket) -> bool {
        self.context.untrack(ticket)
    }

    pub(crate) fn commit_context(&mut self) -> RepoResult<CommitReport> {
        Ok(self.context.commit()?)
    }

    fn find_by_key(&mut self, key: &EntityKey) -> RepoResult<Option<T>> {
        let entity_type = T::entity_type();
        entity_type.check_key(key)?;

        match self.context.resolve(entity_type, key)? {
            Some(document) => Ok(Some(from_document(document)?)),
            None => Ok(None),
        }
    }

    fn insert_inner(&mut self, entity: &T) -> RepoResult<T> {
        let (ticket, report) = self.stage_and_commit(entity, TrackMode::Added)?;
        let document = report.persisted(ticket).cloned().ok_or_else(|| {
            RepoError::InvalidData(format!(
                "commit report has no persisted document for inserted `{}`",
                T::NAME
            ))
        })?;
        Ok(from_document(document)?)
    }

    fn stage_and_commit(
        &mut self,
        entity: &T,
        mode: TrackMode,
    ) -> RepoResult<(TrackTicket, CommitReport)> {
        let ticket = self.stage(entity, mode)?;
        match self.commit_context() {
            Ok(report) => Ok((ticket, report)),
            Err(err) => {
                self.withdraw(ticket);
                Err(err)
            }
        }
    }
}

impl<C, T> Repository<T> for GenericRepository<C, T>
where
    C: PersistenceContext,
    T: Entity,
{
    fn get_all(&mut self) -> RepoResult<Vec<T>> {
        GenericRepository::get_all(self)
    }

    fn find(&mut self, key: EntityKey) -> RepoResult<Option<T>> {
        GenericRepository::find(self, key)
    }

    fn insert(&mut self, entity: T) -> RepoResult<T> {
        GenericRepository::insert(self, entity)
    }

    fn update(&mut self, entity: &T) -> RepoResult<()> {
        GenericRepository::update(self, entity)
    }

    fn delete(&mut self, entity: &T) -> RepoResult<()> {
        GenericRepository::delete(self, entity)
    }
}

fn log_mutation<R>(operation: &str, entity: &str, started_at: Instant, result: &RepoResult<R>) {
    match result {
        Ok(_) => info!(
            "event=repo_{} module=repo status=ok entity={} duration_ms={}",
            operation,
            entity,
            started_at.elapsed().as_millis()
        ),
        Err(err) => log_failure(operation, entity, started_at, err),
    }
}

fn log_failure(operation: &str, entity: &str, started_at: Instant, err: &RepoError) {
    warn!(
        "event=repo_{} module=repo status=error entity={} duration_ms={} error_code={} error={}",
        operation,
        entity,
        started_at.elapsed().as_millis(),
        err.code(),
        err
    );
}
