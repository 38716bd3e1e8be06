//! In-memory backing store.
//!
//! # Responsibility
//! - Keep documents per entity type in insertion order.
//! - Let several contexts share one store through cheap handle clones.
//!
//! # Invariants
//! - `apply` stages every change on a copy and publishes it only when all
//!   changes succeed.
//! - Generated integer keys come from a per-field sequence that never goes
//!   backwards.

use super::tracker::PendingChange;
use super::tracking::{AppliedChange, BackingStore};
use super::{StoreError, StoreResult, TrackMode};
use crate::model::entity::{Document, EntityType};
use crate::model::key::EntityKey;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone)]
struct StoredRow {
    seq: u64,
    document: Document,
}

#[derive(Debug, Clone, Default)]
struct Table {
    rows: HashMap<EntityKey, StoredRow>,
    sequences: HashMap<&'static str, i64>,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    tables: HashMap<&'static str, Table>,
    next_seq: u64,
}

impl Tables {
    fn apply_change(&mut self, change: &PendingChange) -> StoreResult<AppliedChange> {
        let entity_type = change.entity_type();
        match change.mode() {
            TrackMode::Added => self.insert(entity_type, change.document().clone()),
            TrackMode::Modified => {
                let key = change.require_key()?;
                let table = self.tables.entry(entity_type.name()).or_default();
                let row = table.rows.get_mut(&key).ok_or_else(|| StoreError::NotFound {
                    entity: entity_type.name(),
                    key: key.clone(),
                })?;
                row.document = change.document().clone();
                Ok(AppliedChange {
                    key,
                    document: Some(row.document.clone()),
                })
            }
            TrackMode::Removed => {
                let key = change.require_key()?;
                let table = self.tables.entry(entity_type.name()).or_default();
                if table.rows.remove(&key).is_none() {
                    return Err(StoreError::NotFound {
                        entity: entity_type.name(),
                        key,
                    });
                }
                Ok(AppliedChange {
                    key,
                    document: None,
                })
            }
        }
    }

    fn insert(
        &mut self,
        entity_type: EntityType,
        mut document: Document,
    ) -> StoreResult<AppliedChange> {
        let table = self.tables.entry(entity_type.name()).or_default();
        let key = entity_type.fill_generated_keys(&mut document, |field| {
            let next = table.sequences.entry(field.name).or_insert(0);
            *next += 1;
            Ok::<i64, StoreError>(*next)
        })?;

        for (field, value) in entity_type.generated_integers(&key) {
            let last = table.sequences.entry(field.name).or_insert(0);
            *last = (*last).max(value);
        }

        if table.rows.contains_key(&key) {
            return Err(StoreError::constraint(
                entity_type.name(),
                Some(key),
                "identity key already exists",
            ));
        }

        self.next_seq += 1;
        table.rows.insert(
            key.clone(),
            StoredRow {
                seq: self.next_seq,
                document: document.clone(),
            },
        );
        Ok(AppliedChange {
            key,
            document: Some(document),
        })
    }
}

/// Shared in-memory store; clones are handles to the same data.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents of one entity type.
    pub fn count(&self, entity_type: EntityType) -> StoreResult<usize> {
        let tables = self.inner.read().map_err(|_| poisoned())?;
        Ok(tables
            .tables
            .get(entity_type.name())
            .map_or(0, |table| table.rows.len()))
    }
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("in-memory store lock poisoned".to_string())
}

impl BackingStore for InMemoryStore {
    fn load(&self, entity_type: EntityType, key: &EntityKey) -> StoreResult<Option<Document>> {
        let tables = self.inner.read().map_err(|_| poisoned())?;
        Ok(tables
            .tables
            .get(entity_type.name())
            .and_then(|table| table.rows.get(key))
            .map(|row| row.document.clone()))
    }

    fn load_all(&self, entity_type: EntityType) -> StoreResult<Vec<Document>> {
        let tables = self.inner.read().map_err(|_| poisoned())?;
        let Some(table) = tables.tables.get(entity_type.name()) else {
            return Ok(Vec::new());
        };

        let mut rows: Vec<&StoredRow> = table.rows.values().collect();
        rows.sort_by_key(|row| row.seq);
        Ok(rows.into_iter().map(|row| row.document.clone()).collect())
    }

    fn apply(&mut self, changes: &[PendingChange]) -> StoreResult<Vec<AppliedChange>> {
        let mut tables = self.inner.write().map_err(|_| poisoned())?;
        let mut staged = tables.clone();

        let mut applied = Vec::with_capacity(changes.len());
        for change in changes {
            applied.push(staged.apply_change(change)?);
        }

        *tables = staged;
        debug!(
            "event=store_apply module=store backend=memory status=ok changes={}",
            applied.len()
        );
        Ok(applied)
    }
}
