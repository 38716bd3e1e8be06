//! Generic entity repository over a change-tracking persistence context.
//!
//! Entities declare their identity key fields; `GenericRepository` provides
//! CRUD for any of them on top of a `PersistenceContext` that resolves
//! identities, tracks changes and commits them in one batch.

pub mod context;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;

pub use context::{
    BackingStore, CommitReport, InMemoryStore, PersistenceContext, SqliteStore, StoreError,
    StoreResult, TrackMode, TrackTicket, TrackingContext,
};
pub use db::{open_db, open_db_in_memory, open_db_with, DbError, DbOptions, DbResult};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::entity::{Document, Entity, EntityType, KeyField, KeyGeneration, MappingError};
pub use model::key::{EntityKey, KeyKind, KeyShapeError, KeyValue};
pub use repo::{Batch, BatchOutcome, GenericRepository, RepoError, RepoResult, Repository};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
