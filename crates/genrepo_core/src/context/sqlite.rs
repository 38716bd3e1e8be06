//! SQLite document store.
//!
//! # Responsibility
//! - Persist entity documents as JSON text in the `entities` table, keyed by
//!   `(entity_type, entity_key)`.
//! - Generate integer keys from `key_sequences`.
//! - Translate SQLite failures into store errors.
//!
//! # Invariants
//! - `apply` runs inside one `IMMEDIATE` transaction; any failure rolls the
//!   whole batch back.
//! - `entity_key` holds `EntityKey::encode()` output.
//! - Store order is `seq` order, i.e. insertion order.

use super::tracker::PendingChange;
use super::tracking::{AppliedChange, BackingStore};
use super::{StoreError, StoreResult, TrackMode};
use crate::db::migrations::{current_version, latest_version};
use crate::db::{DbError, DbResult};
use crate::model::entity::{Document, EntityType};
use crate::model::key::EntityKey;
use log::debug;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use std::time::Instant;

const ENTITY_COLUMNS: &[&str] = &[
    "seq",
    "entity_type",
    "entity_key",
    "document",
    "created_at",
    "updated_at",
];
const SEQUENCE_COLUMNS: &[&str] = &["entity_type", "field", "last_value"];

/// SQLite-backed document store over a migrated connection.
pub struct SqliteStore<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteStore<'conn> {
    /// Creates a store from a connection opened through `db::open_db*`.
    ///
    /// # Errors
    /// - `UninitializedConnection` when migrations were not applied.
    /// - `MissingRequiredTable` / `MissingRequiredColumn` for a damaged schema.
    pub fn try_new(conn: &'conn Connection) -> DbResult<Self> {
        ensure_store_connection_ready(conn)?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &'conn Connection {
        self.conn
    }
}

impl BackingStore for SqliteStore<'_> {
    fn load(&self, entity_type: EntityType, key: &EntityKey) -> StoreResult<Option<Document>> {
        let text: Option<String> = self
            .conn
            .query_row(
                "SELECT document
                 FROM entities
                 WHERE entity_type = ?1 AND entity_key = ?2;",
                params![entity_type.name(), key.encode()],
                |row| row.get(0),
            )
            .optional()
            .map_err(sqlite_error)?;

        text.map(|text| parse_document(entity_type, &text))
            .transpose()
    }

    fn load_all(&self, entity_type: EntityType) -> StoreResult<Vec<Document>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT document
                 FROM entities
                 WHERE entity_type = ?1
                 ORDER BY seq ASC;",
            )
            .map_err(sqlite_error)?;
        let mut rows = stmt.query([entity_type.name()]).map_err(sqlite_error)?;

        let mut documents = Vec::new();
        while let Some(row) = rows.next().map_err(sqlite_error)? {
            let text: String = row.get(0).map_err(sqlite_error)?;
            documents.push(parse_document(entity_type, &text)?);
        }
        Ok(documents)
    }

    fn apply(&mut self, changes: &[PendingChange]) -> StoreResult<Vec<AppliedChange>> {
        let started_at = Instant::now();
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)
            .map_err(sqlite_error)?;

        let mut applied = Vec::with_capacity(changes.len());
        for change in changes {
            applied.push(apply_change(&tx, change)?);
        }
        tx.commit().map_err(sqlite_error)?;

        debug!(
            "event=store_apply module=store backend=sqlite status=ok changes={} duration_ms={}",
            applied.len(),
            started_at.elapsed().as_millis()
        );
        Ok(applied)
    }
}

fn apply_change(tx: &Transaction<'_>, change: &PendingChange) -> StoreResult<AppliedChange> {
    let entity_type = change.entity_type();
    let entity = entity_type.name();

    match change.mode() {
        TrackMode::Added => {
            let mut document = change.document().clone();
            let key = entity_type.fill_generated_keys(&mut document, |field| {
                next_sequence_value(tx, entity, field.name)
            })?;
            for (field, value) in entity_type.generated_integers(&key) {
                observe_sequence_value(tx, entity, field.name, value)?;
            }

            if row_exists(tx, entity, &key)? {
                return Err(StoreError::constraint(
                    entity,
                    Some(key),
                    "identity key already exists",
                ));
            }

            tx.execute(
                "INSERT INTO entities (entity_type, entity_key, document)
                 VALUES (?1, ?2, ?3);",
                params![entity, key.encode(), encode_document(entity_type, &document)?],
            )
            .map_err(|err| write_error(err, entity, &key))?;

            Ok(AppliedChange {
                key,
                document: Some(document),
            })
        }
        TrackMode::Modified => {
            let key = change.require_key()?;
            let document = change.document().clone();
            let changed = tx
                .execute(
                    "UPDATE entities
                     SET
                        document = ?3,
                        updated_at = (strftime('%s', 'now') * 1000)
                     WHERE entity_type = ?1 AND entity_key = ?2;",
                    params![entity, key.encode(), encode_document(entity_type, &document)?],
                )
                .map_err(|err| write_error(err, entity, &key))?;

            if changed == 0 {
                return Err(StoreError::NotFound { entity, key });
            }
            Ok(AppliedChange {
                key,
                document: Some(document),
            })
        }
        TrackMode::Removed => {
            let key = change.require_key()?;
            let changed = tx
                .execute(
                    "DELETE FROM entities WHERE entity_type = ?1 AND entity_key = ?2;",
                    params![entity, key.encode()],
                )
                .map_err(|err| write_error(err, entity, &key))?;

            if changed == 0 {
                return Err(StoreError::NotFound { entity, key });
            }
            Ok(AppliedChange {
                key,
                document: None,
            })
        }
    }
}

fn row_exists(tx: &Transaction<'_>, entity: &str, key: &EntityKey) -> StoreResult<bool> {
    let exists: i64 = tx
        .query_row(
            "SELECT EXISTS(
                SELECT 1 FROM entities WHERE entity_type = ?1 AND entity_key = ?2
            );",
            params![entity, key.encode()],
            |row| row.get(0),
        )
        .map_err(sqlite_error)?;
    Ok(exists == 1)
}

fn next_sequence_value(tx: &Transaction<'_>, entity: &str, field: &str) -> StoreResult<i64> {
    tx.query_row(
        "INSERT INTO key_sequences (entity_type, field, last_value)
         VALUES (?1, ?2, 1)
         ON CONFLICT (entity_type, field) DO UPDATE SET last_value = last_value + 1
         RETURNING last_value;",
        params![entity, field],
        |row| row.get(0),
    )
    .map_err(sqlite_error)
}

fn observe_sequence_value(
    tx: &Transaction<'_>,
    entity: &str,
    field: &str,
    value: i64,
) -> StoreResult<()> {
    tx.execute(
        "INSERT INTO key_sequences (entity_type, field, last_value)
         VALUES (?1, ?2, ?3)
         ON CONFLICT (entity_type, field)
         DO UPDATE SET last_value = MAX(last_value, excluded.last_value);",
        params![entity, field, value],
    )
    .map_err(sqlite_error)?;
    Ok(())
}

fn encode_document(entity_type: EntityType, document: &Document) -> StoreResult<String> {
    serde_json::to_string(document).map_err(|err| {
        StoreError::InvalidData(format!(
            "cannot encode `{}` document: {err}",
            entity_type.name()
        ))
    })
}

fn parse_document(entity_type: EntityType, text: &str) -> StoreResult<Document> {
    serde_json::from_str(text).map_err(|err| {
        StoreError::InvalidData(format!(
            "invalid document in entities.document for `{}`: {err}",
            entity_type.name()
        ))
    })
}

fn sqlite_error(err: rusqlite::Error) -> StoreError {
    StoreError::Db(DbError::Sqlite(err))
}

fn write_error(err: rusqlite::Error, entity: &'static str, key: &EntityKey) -> StoreError {
    if err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) {
        return StoreError::constraint(entity, Some(key.clone()), err.to_string());
    }
    sqlite_error(err)
}

fn ensure_store_connection_ready(conn: &Connection) -> DbResult<()> {
    let expected_version = latest_version();
    let actual_version = current_version(conn)?;
    if actual_version != expected_version {
        return Err(DbError::UninitializedConnection {
            expected_version,
            actual_version,
        });
    }

    for (table, columns) in [("entities", ENTITY_COLUMNS), ("key_sequences", SEQUENCE_COLUMNS)] {
        if !table_exists(conn, table)? {
            return Err(DbError::MissingRequiredTable(table));
        }
        for &column in columns {
            if !table_has_column(conn, table, column)? {
                return Err(DbError::MissingRequiredColumn { table, column });
            }
        }
    }

    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> DbResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM sqlite_master
            WHERE type = 'table' AND name = ?1
        );",
        [table],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> DbResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table});"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let current: String = row.get(1)?;
        if current == column {
            return Ok(true);
        }
    }
    Ok(false)
}
