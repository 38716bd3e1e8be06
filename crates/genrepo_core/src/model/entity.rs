//! Entity capability contract and document mapping.
//!
//! # Responsibility
//! - Let an application type declare its name and identity key fields.
//! - Map entity values to and from `Document`s, the form contexts track and
//!   stores persist.
//! - Read and generate identity keys from documents.
//!
//! # Invariants
//! - Key field order in `Entity::KEY` is the order of `EntityKey` values.
//! - Only `KeyGeneration::Generated` fields may be unset before commit.

use crate::model::key::{EntityKey, KeyKind, KeyShapeError, KeyValue};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Mapped form of one entity instance: a JSON object keyed by field name.
pub type Document = Map<String, Value>;

/// Who assigns a key field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyGeneration {
    /// Caller always provides the value.
    Assigned,
    /// Store fills the value on insert when it is unset.
    Generated,
}

/// Declaration of one identity key field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyField {
    pub name: &'static str,
    pub kind: KeyKind,
    pub generation: KeyGeneration,
}

impl KeyField {
    pub const fn assigned(name: &'static str, kind: KeyKind) -> Self {
        Self {
            name,
            kind,
            generation: KeyGeneration::Assigned,
        }
    }

    pub const fn generated(name: &'static str, kind: KeyKind) -> Self {
        Self {
            name,
            kind,
            generation: KeyGeneration::Generated,
        }
    }

    pub fn is_generated(&self) -> bool {
        self.generation == KeyGeneration::Generated
    }

    /// Reads this field from a document.
    ///
    /// Returns `Ok(None)` for an unset generated field: missing, `null`, nil
    /// UUID, integer `0`, or empty text.
    fn read(
        &self,
        entity: &'static str,
        document: &Document,
    ) -> Result<Option<KeyValue>, KeyShapeError> {
        let raw = match document.get(self.name) {
            None | Some(Value::Null) => {
                if self.is_generated() {
                    return Ok(None);
                }
                return Err(KeyShapeError::MissingField {
                    entity,
                    field: self.name,
                });
            }
            Some(raw) => raw,
        };

        let invalid = |message: String| KeyShapeError::InvalidValue {
            entity,
            field: self.name,
            message,
        };

        let value = match self.kind {
            KeyKind::Uuid => {
                let text = raw
                    .as_str()
                    .ok_or_else(|| invalid(format!("expected uuid string, got `{raw}`")))?;
                let id = Uuid::parse_str(text)
                    .map_err(|_| invalid(format!("invalid uuid `{text}`")))?;
                KeyValue::Uuid(id)
            }
            KeyKind::Integer => {
                let number = raw
                    .as_i64()
                    .ok_or_else(|| invalid(format!("expected integer, got `{raw}`")))?;
                KeyValue::Integer(number)
            }
            KeyKind::Text => {
                let text = raw
                    .as_str()
                    .ok_or_else(|| invalid(format!("expected string, got `{raw}`")))?;
                KeyValue::Text(text.to_string())
            }
        };

        if self.is_generated() && is_unset_value(&value) {
            return Ok(None);
        }
        Ok(Some(value))
    }
}

fn is_unset_value(value: &KeyValue) -> bool {
    match value {
        KeyValue::Uuid(id) => id.is_nil(),
        KeyValue::Integer(number) => *number == 0,
        KeyValue::Text(text) => text.is_empty(),
    }
}

/// Runtime descriptor of an entity type: its name and key fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityType {
    name: &'static str,
    key_fields: &'static [KeyField],
}

impl EntityType {
    pub const fn new(name: &'static str, key_fields: &'static [KeyField]) -> Self {
        Self { name, key_fields }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn key_fields(&self) -> &'static [KeyField] {
        self.key_fields
    }

    /// Validates arity and kinds of caller-provided key values.
    pub fn check_key(&self, key: &EntityKey) -> Result<(), KeyShapeError> {
        if key.len() != self.key_fields.len() {
            return Err(KeyShapeError::ArityMismatch {
                entity: self.name,
                expected: self.key_fields.len(),
                actual: key.len(),
            });
        }

        for (field, value) in self.key_fields.iter().zip(key.values()) {
            if value.kind() != field.kind {
                return Err(KeyShapeError::KindMismatch {
                    entity: self.name,
                    field: field.name,
                    expected: field.kind,
                    actual: value.kind(),
                });
            }
        }

        Ok(())
    }

    /// Extracts the identity key of a document.
    ///
    /// Fails with `KeyShapeError::UnsetKey` when a generated field has no
    /// value yet.
    pub fn key_of(&self, document: &Document) -> Result<EntityKey, KeyShapeError> {
        let mut values = Vec::with_capacity(self.key_fields.len());
        for field in self.key_fields {
            match field.read(self.name, document)? {
                Some(value) => values.push(value),
                None => {
                    return Err(KeyShapeError::UnsetKey {
                        entity: self.name,
                        field: field.name,
                    })
                }
            }
        }
        Ok(EntityKey::new(values))
    }

    /// Fills unset generated key fields in place and returns the full key.
    ///
    /// `Uuid` and `Text` fields receive a fresh v4 UUID; `Integer` fields ask
    /// `next_integer` for the next sequence value.
    pub fn fill_generated_keys<E>(
        &self,
        document: &mut Document,
        mut next_integer: impl FnMut(&KeyField) -> Result<i64, E>,
    ) -> Result<EntityKey, E>
    where
        E: From<KeyShapeError>,
    {
        let mut values = Vec::with_capacity(self.key_fields.len());
        for field in self.key_fields {
            let value = match field.read(self.name, document)? {
                Some(value) => value,
                None => {
                    let generated = match field.kind {
                        KeyKind::Uuid => KeyValue::Uuid(Uuid::new_v4()),
                        KeyKind::Text => KeyValue::Text(Uuid::new_v4().to_string()),
                        KeyKind::Integer => KeyValue::Integer(next_integer(field)?),
                    };
                    document.insert(field.name.to_string(), generated.to_json());
                    generated
                }
            };
            values.push(value);
        }
        Ok(EntityKey::new(values))
    }

    /// Generated integer key values present in `key`, paired with their field.
    pub fn generated_integers<'a>(
        &self,
        key: &'a EntityKey,
    ) -> impl Iterator<Item = (&'static KeyField, i64)> + 'a {
        self.key_fields
            .iter()
            .zip(key.values())
            .filter_map(|(field, value)| match value {
                KeyValue::Integer(number) if field.is_generated() => Some((field, *number)),
                _ => None,
            })
    }
}

/// Capability contract for types handled by `GenericRepository`.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Person {
///     person_id: Option<Uuid>,
///     first_name: String,
/// }
///
/// impl Entity for Person {
///     const NAME: &'static str = "person";
///     const KEY: &'static [KeyField] = &[KeyField::generated("person_id", KeyKind::Uuid)];
/// }
/// ```
pub trait Entity: Serialize + DeserializeOwned {
    /// Entity type name; unique per store.
    const NAME: &'static str;
    /// Identity key fields in key order, named as in the serialized form.
    const KEY: &'static [KeyField];

    fn entity_type() -> EntityType {
        EntityType::new(Self::NAME, Self::KEY)
    }
}

/// Entity value could not be mapped to or from its document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingError {
    pub entity: &'static str,
    pub message: String,
}

impl Display for MappingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot map `{}`: {}", self.entity, self.message)
    }
}

impl Error for MappingError {}

/// Serializes an entity into its document form.
pub fn to_document<T: Entity>(entity: &T) -> Result<Document, MappingError> {
    let value = serde_json::to_value(entity).map_err(|err| MappingError {
        entity: T::NAME,
        message: err.to_string(),
    })?;

    match value {
        Value::Object(document) => Ok(document),
        other => Err(MappingError {
            entity: T::NAME,
            message: format!("expected a struct-like value, got `{other}`"),
        }),
    }
}

/// Rebuilds an entity value from a document.
pub fn from_document<T: Entity>(document: Document) -> Result<T, MappingError> {
    serde_json::from_value(Value::Object(document)).map_err(|err| MappingError {
        entity: T::NAME,
        message: err.to_string(),
    })
}
