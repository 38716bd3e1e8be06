//! Caller-controlled commit scope.
//!
//! # Responsibility
//! - Stage several inserts, updates and deletes on one repository and flush
//!   them with a single context commit.
//!
//! # Invariants
//! - A batch borrows its repository mutably; no implicit commit runs while it
//!   is open.
//! - A batch that is dropped or fails to commit withdraws its staged changes
//!   in reverse staging order.

use super::generic_repo::GenericRepository;
use super::{RepoError, RepoResult};
use crate::context::{PersistenceContext, TrackMode, TrackTicket};
use crate::model::entity::{from_document, Entity};
use log::{debug, info, warn};
use std::time::Instant;

/// Result of a committed batch.
#[derive(Debug)]
pub struct BatchOutcome<T> {
    /// Inserted entities as persisted, in commit order.
    pub inserted: Vec<T>,
    /// Committed updates, after collapsing changes to the same identity.
    pub updated: usize,
    /// Committed deletes, after collapsing changes to the same identity.
    pub deleted: usize,
}

/// Staged changes over one repository.
#[derive(Debug)]
pub struct Batch<'repo, C, T>
where
    C: PersistenceContext,
    T: Entity,
{
    repo: &'repo mut GenericRepository<C, T>,
    staged: Vec<TrackTicket>,
    finished: bool,
}

impl<'repo, C, T> Batch<'repo, C, T>
where
    C: PersistenceContext,
    T: Entity,
{
    pub(crate) fn new(repo: &'repo mut GenericRepository<C, T>) -> Self {
        Self {
            repo,
            staged: Vec::new(),
            finished: false,
        }
    }

    /// Stages an insert.
    pub fn insert(&mut self, entity: &T) -> RepoResult<&mut Self> {
        self.stage(entity, TrackMode::Added)
    }

    /// Stages an update; the key of `entity` must be set.
    pub fn update(&mut self, entity: &T) -> RepoResult<&mut Self> {
        self.stage(entity, TrackMode::Modified)
    }

    /// Stages a delete.
    pub fn delete(&mut self, entity: &T) -> RepoResult<&mut Self> {
        self.stage(entity, TrackMode::Removed)
    }

    /// Number of staged changes.
    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Flushes the context once.
    ///
    /// The outcome counts what was written: an insert deleted again inside
    /// the batch counts as nothing, an insert followed by updates as one
    /// insert.
    ///
    /// # Errors
    /// - Any commit failure; every change staged through this batch is then
    ///   withdrawn.
    /// - `InvalidData` when the commit succeeded but an inserted document
    ///   could not be decoded back into `T`. The data is persisted.
    pub fn commit(mut self) -> RepoResult<BatchOutcome<T>> {
        let started_at = Instant::now();
        let report = match self.repo.commit_context() {
            Ok(report) => report,
            Err(err) => {
                warn!(
                    "event=repo_batch_commit module=repo status=error entity={} staged={} duration_ms={} error_code={} error={}",
                    T::NAME,
                    self.staged.len(),
                    started_at.elapsed().as_millis(),
                    err.code(),
                    err
                );
                return Err(err);
            }
        };
        self.finished = true;

        let mut outcome = BatchOutcome {
            inserted: Vec::new(),
            updated: 0,
            deleted: 0,
        };
        let committed = report.changes().iter().filter(|change| {
            change
                .tickets
                .iter()
                .any(|ticket| self.staged.contains(ticket))
        });
        for change in committed {
            match (change.mode, &change.document) {
                (TrackMode::Added, Some(document)) => {
                    let entity = from_document::<T>(document.clone()).map_err(|err| {
                        RepoError::InvalidData(format!(
                            "batch committed, but an inserted document could not be decoded: {err}"
                        ))
                    })?;
                    outcome.inserted.push(entity);
                }
                (TrackMode::Added, None) => {}
                (TrackMode::Modified, _) => outcome.updated += 1,
                (TrackMode::Removed, _) => outcome.deleted += 1,
            }
        }

        info!(
            "event=repo_batch_commit module=repo status=ok entity={} inserted={} updated={} deleted={} duration_ms={}",
            T::NAME,
            outcome.inserted.len(),
            outcome.updated,
            outcome.deleted,
            started_at.elapsed().as_millis()
        );
        Ok(outcome)
    }

    /// Withdraws every staged change without committing.
    pub fn discard(self) {}

    fn stage(&mut self, entity: &T, mode: TrackMode) -> RepoResult<&mut Self> {
        let ticket = self.repo.stage(entity, mode)?;
        self.staged.push(ticket);
        Ok(self)
    }
}

impl<C, T> Drop for Batch<'_, C, T>
where
    C: PersistenceContext,
    T: Entity,
{
    fn drop(&mut self) {
        if self.finished || self.staged.is_empty() {
            return;
        }

        let mut withdrawn = 0;
        for ticket in self.staged.iter().rev() {
            if self.repo.withdraw(*ticket) {
                withdrawn += 1;
            }
        }
        debug!(
            "event=repo_batch_discard module=repo status=ok entity={} staged={} withdrawn={}",
            T::NAME,
            self.staged.len(),
            withdrawn
        );
    }
}
