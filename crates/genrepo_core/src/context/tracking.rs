//! `PersistenceContext` implementation shared by every backing store.
//!
//! # Responsibility
//! - Combine a `ChangeTracker` with a `BackingStore`.
//! - Resolve identities through the tracked set before the store.
//! - Flush the pending change set through one atomic `BackingStore::apply`.
//!
//! # Invariants
//! - The tracker is only updated after the store reports success.

use super::tracker::{ChangeTracker, EntryState, PendingChange};
use super::{CommitReport, PersistenceContext, StoreError, StoreResult, TrackMode, TrackTicket};
use crate::model::entity::{Document, EntityType};
use crate::model::key::EntityKey;
use log::{debug, error, info, warn};
use std::time::Instant;

/// Result of applying one pending change.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedChange {
    /// Final identity key, including generated values.
    pub key: EntityKey,
    /// Document as written; `None` for removals.
    pub document: Option<Document>,
}

/// Storage behind a `TrackingContext`.
///
/// Key generation, duplicate detection and missing-row detection happen here.
pub trait BackingStore {
    fn load(&self, entity_type: EntityType, key: &EntityKey) -> StoreResult<Option<Document>>;

    /// All documents of `entity_type` in store order.
    fn load_all(&self, entity_type: EntityType) -> StoreResult<Vec<Document>>;

    /// Applies `changes` in order, all or nothing.
    ///
    /// On success must return exactly one `AppliedChange` per input change,
    /// in input order. A store that persists the changes but reports another
    /// count leaves the context's pending set stale.
    fn apply(&mut self, changes: &[PendingChange]) -> StoreResult<Vec<AppliedChange>>;
}

/// Change-tracking context over a backing store.
#[derive(Debug)]
pub struct TrackingContext<S> {
    store: S,
    tracker: ChangeTracker,
}

impl<S: BackingStore> TrackingContext<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            tracker: ChangeTracker::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    /// Ends the unit of work, dropping the tracked set.
    pub fn into_store(self) -> S {
        self.store
    }
}

impl<S: BackingStore> PersistenceContext for TrackingContext<S> {
    fn resolve(
        &mut self,
        entity_type: EntityType,
        key: &EntityKey,
    ) -> StoreResult<Option<Document>> {
        entity_type.check_key(key)?;

        if let Some((state, document)) = self.tracker.get(entity_type, key) {
            if state == EntryState::Removed {
                return Ok(None);
            }
            return Ok(Some(document.clone()));
        }

        match self.store.load(entity_type, key)? {
            Some(document) => Ok(Some(self.tracker.attach_unchanged(
                entity_type,
                key.clone(),
                document,
            ))),
            None => Ok(None),
        }
    }

    fn materialize_all(&mut self, entity_type: EntityType) -> StoreResult<Vec<Document>> {
        let documents = self.store.load_all(entity_type)?;
        let mut materialized = Vec::with_capacity(documents.len());
        for document in documents {
            let key = entity_type.key_of(&document).map_err(|err| {
                StoreError::InvalidData(format!(
                    "stored `{}` document has an invalid key: {err}",
                    entity_type.name()
                ))
            })?;
            materialized.push(self.tracker.attach_unchanged(entity_type, key, document));
        }
        Ok(materialized)
    }

    fn track(
        &mut self,
        entity_type: EntityType,
        document: Document,
        mode: TrackMode,
    ) -> StoreResult<TrackTicket> {
        let key = match entity_type.key_of(&document) {
            Ok(key) => Some(key),
            Err(err) if err.is_unset() && mode == TrackMode::Added => None,
            Err(err) => return Err(err.into()),
        };

        let ticket = self.tracker.track(entity_type, key, document, mode)?;
        debug!(
            "event=context_track module=context status=ok entity={} mode={} pending={}",
            entity_type.name(),
            mode.as_str(),
            self.tracker.pending_count()
        );
        Ok(ticket)
    }

    fn untrack(&mut self, ticket: TrackTicket) -> bool {
        self.tracker.untrack(ticket)
    }

    fn discard_pending(&mut self) {
        let discarded = self.tracker.pending_count();
        self.tracker.discard();
        debug!("event=context_discard module=context status=ok discarded={discarded}");
    }

    fn pending_count(&self) -> usize {
        self.tracker.pending_count()
    }

    fn commit(&mut self) -> StoreResult<CommitReport> {
        let pending = self.tracker.pending();
        if pending.is_empty() {
            debug!("event=context_commit module=context status=ok changes=0");
            return Ok(CommitReport::default());
        }

        let started_at = Instant::now();
        let applied = match self.store.apply(&pending) {
            Ok(applied) => applied,
            Err(err) => {
                warn!(
                    "event=context_commit module=context status=error changes={} duration_ms={} error={}",
                    pending.len(),
                    started_at.elapsed().as_millis(),
                    err
                );
                return Err(err);
            }
        };

        if applied.len() != pending.len() {
            error!(
                "event=context_commit module=context status=error changes={} applied={} duration_ms={} error_code=store_apply_mismatch",
                pending.len(),
                applied.len(),
                started_at.elapsed().as_millis()
            );
            return Err(StoreError::InvalidData(format!(
                "store applied {} of {} pending changes",
                applied.len(),
                pending.len()
            )));
        }

        let report = self.tracker.accept(pending, applied);
        info!(
            "event=context_commit module=context status=ok changes={} added={} modified={} removed={} duration_ms={}",
            report.len(),
            report.count(TrackMode::Added),
            report.count(TrackMode::Modified),
            report.count(TrackMode::Removed),
            started_at.elapsed().as_millis()
        );
        Ok(report)
    }
}
