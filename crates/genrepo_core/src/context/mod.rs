//! Persistence context contract and its tracking implementation.
//!
//! # Responsibility
//! - Define `PersistenceContext`, the capability a repository delegates to:
//!   identity resolution, change tracking and batched commit.
//! - Provide `TrackingContext`, one change tracker over any `BackingStore`,
//!   with in-memory and SQLite stores.
//!
//! # Invariants
//! - One context serves one unit of work; mutating calls take `&mut self`.
//! - A successful `commit` clears the pending change set atomically; a failed
//!   one leaves it untouched.

use crate::db::DbError;
use crate::model::entity::{Document, EntityType, MappingError};
use crate::model::key::{EntityKey, KeyShapeError};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod memory;
pub mod sqlite;
pub mod tracker;
pub mod tracking;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;
pub use tracker::{ChangeTracker, EntryState, PendingChange};
pub use tracking::{AppliedChange, BackingStore, TrackingContext};

pub type StoreResult<T> = Result<T, StoreError>;

/// Error raised by contexts and backing stores.
#[derive(Debug)]
pub enum StoreError {
    InvalidKeyShape(KeyShapeError),
    NotFound {
        entity: &'static str,
        key: EntityKey,
    },
    ConstraintViolation {
        entity: &'static str,
        key: Option<EntityKey>,
        message: String,
    },
    /// Backing store cannot be reached or refused the operation.
    Unavailable(String),
    Db(DbError),
    /// Persisted or tracked data cannot be mapped.
    InvalidData(String),
}

impl StoreError {
    pub fn constraint(
        entity: &'static str,
        key: Option<EntityKey>,
        message: impl Into<String>,
    ) -> Self {
        Self::ConstraintViolation {
            entity,
            key,
            message: message.into(),
        }
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidKeyShape(err) => write!(f, "{err}"),
            Self::NotFound { entity, key } => write!(f, "{entity} not found: {key}"),
            Self::ConstraintViolation {
                entity,
                key: Some(key),
                message,
            } => write!(f, "{entity} {key} violates a constraint: {message}"),
            Self::ConstraintViolation {
                entity,
                key: None,
                message,
            } => write!(f, "{entity} violates a constraint: {message}"),
            Self::Unavailable(message) => write!(f, "backing store unavailable: {message}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::InvalidData(message) => write!(f, "invalid entity data: {message}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidKeyShape(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::NotFound { .. } => None,
            Self::ConstraintViolation { .. } => None,
            Self::Unavailable(_) => None,
            Self::InvalidData(_) => None,
        }
    }
}

impl From<KeyShapeError> for StoreError {
    fn from(value: KeyShapeError) -> Self {
        Self::InvalidKeyShape(value)
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<MappingError> for StoreError {
    fn from(value: MappingError) -> Self {
        Self::InvalidData(value.to_string())
    }
}

/// Change a caller asks the context to track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackMode {
    Added,
    Modified,
    Removed,
}

impl TrackMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Removed => "removed",
        }
    }
}

/// Handle for one `track` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackTicket(pub(crate) u64);

/// One change flushed by a successful commit.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedChange {
    pub entity: &'static str,
    pub key: EntityKey,
    pub mode: TrackMode,
    /// Final persisted document; `None` for removals.
    pub document: Option<Document>,
    /// Tickets whose changes were collapsed into this one.
    pub tickets: Vec<TrackTicket>,
}

/// Outcome of a successful commit, in flush order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitReport {
    changes: Vec<CommittedChange>,
}

impl CommitReport {
    pub(crate) fn new(changes: Vec<CommittedChange>) -> Self {
        Self { changes }
    }

    pub fn changes(&self) -> &[CommittedChange] {
        &self.changes
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn count(&self, mode: TrackMode) -> usize {
        self.changes
            .iter()
            .filter(|change| change.mode == mode)
            .count()
    }

    /// Final document written for the change `ticket` contributed to.
    ///
    /// Returns `None` when that change was a removal or was not part of this
    /// commit.
    pub fn persisted(&self, ticket: TrackTicket) -> Option<&Document> {
        self.changes
            .iter()
            .find(|change| change.tickets.contains(&ticket))
            .and_then(|change| change.document.as_ref())
    }
}

/// Change-tracking unit of work over a backing store.
///
/// Implementations resolve entities by identity, remember every instance they
/// hand out or receive (the tracked set), and flush all pending changes in
/// one `commit`.
pub trait PersistenceContext {
    /// Resolves one document by identity, consulting the tracked set first.
    ///
    /// A pending removal resolves to `None`.
    fn resolve(
        &mut self,
        entity_type: EntityType,
        key: &EntityKey,
    ) -> StoreResult<Option<Document>>;

    /// Loads every persisted document of `entity_type` in store order.
    fn materialize_all(&mut self, entity_type: EntityType) -> StoreResult<Vec<Document>>;

    /// Records a pending change without touching the store.
    fn track(
        &mut self,
        entity_type: EntityType,
        document: Document,
        mode: TrackMode,
    ) -> StoreResult<TrackTicket>;

    /// Withdraws the change recorded by `ticket` if it is still the latest
    /// pending change of its entry. Returns whether anything was withdrawn.
    fn untrack(&mut self, ticket: TrackTicket) -> bool;

    /// Drops every pending change.
    fn discard_pending(&mut self);

    fn pending_count(&self) -> usize;

    /// Flushes all pending changes as one batch.
    fn commit(&mut self) -> StoreResult<CommitReport>;
}

impl<C> PersistenceContext for &mut C
where
    C: PersistenceContext + ?Sized,
{
    fn resolve(
        &mut self,
        entity_type: EntityType,
        key: &EntityKey,
    ) -> StoreResult<Option<Document>> {
        (**self).resolve(entity_type, key)
    }

    fn materialize_all(&mut self, entity_type: EntityType) -> StoreResult<Vec<Document>> {
        (**self).materialize_all(entity_type)
    }

    fn track(
        &mut self,
        entity_type: EntityType,
        document: Document,
        mode: TrackMode,
    ) -> StoreResult<TrackTicket> {
        (**self).track(entity_type, document, mode)
    }

    fn untrack(&mut self, ticket: TrackTicket) -> bool {
        (**self).untrack(ticket)
    }

    fn discard_pending(&mut self) {
        (**self).discard_pending()
    }

    fn pending_count(&self) -> usize {
        (**self).pending_count()
    }

    fn commit(&mut self) -> StoreResult<CommitReport> {
        (**self).commit()
    }
}
