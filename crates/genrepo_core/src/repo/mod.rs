//! Typed repository layer over a persistence context.
//!
//! # Responsibility
//! - Expose one CRUD surface for every `Entity` type, driven only by the
//!   entity's declared key fields.
//! - Map context failures onto the repository error taxonomy.
//!
//! # Invariants
//! - Every mutating call commits the whole context, except inside a `Batch`.
//! - A mutating call whose commit fails withdraws the change it staged.

use crate::context::StoreError;
use crate::model::entity::MappingError;
use crate::model::key::{EntityKey, KeyShapeError};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod batch;
pub mod generic_repo;

pub use batch::{Batch, BatchOutcome};
pub use generic_repo::{GenericRepository, Repository};

pub type RepoResult<T> = Result<T, RepoError>;

/// Error returned by repository operations.
#[derive(Debug)]
pub enum RepoError {
    /// Key arity or kind does not match the entity, or a required key is
    /// unset.
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
    /// Backing store failed or could not be reached.
    StoreUnavailable(String),
    /// Entity and document could not be mapped.
    InvalidData(String),
}

impl RepoError {
    /// Stable code used in log events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidKeyShape(_) => "invalid_key_shape",
            Self::NotFound { .. } => "not_found",
            Self::ConstraintViolation { .. } => "constraint_violation",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::InvalidData(_) => "invalid_data",
        }
    }
}

impl Display for RepoError {
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
            Self::StoreUnavailable(message) => write!(f, "store unavailable: {message}"),
            Self::InvalidData(message) => write!(f, "invalid entity data: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidKeyShape(err) => Some(err),
            Self::NotFound { .. } => None,
            Self::ConstraintViolation { .. } => None,
            Self::StoreUnavailable(_) => None,
            Self::InvalidData(_) => None,
        }
    }
}

impl From<KeyShapeError> for RepoError {
    fn from(value: KeyShapeError) -> Self {
        Self::InvalidKeyShape(value)
    }
}

impl From<MappingError> for RepoError {
    fn from(value: MappingError) -> Self {
        Self::InvalidData(value.to_string())
    }
}

impl From<StoreError> for RepoError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::InvalidKeyShape(err) => Self::InvalidKeyShape(err),
            StoreError::NotFound { entity, key } => Self::NotFound { entity, key },
            StoreError::ConstraintViolation {
                entity,
                key,
                message,
            } => Self::ConstraintViolation {
                entity,
                key,
                message,
            },
            StoreError::Unavailable(message) => Self::StoreUnavailable(message),
            StoreError::Db(err) => Self::StoreUnavailable(err.to_string()),
            StoreError::InvalidData(message) => Self::InvalidData(message),
        }
    }
}
