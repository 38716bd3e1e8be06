//! Identity key values.
//!
//! # Responsibility
//! - Represent one key field value (`KeyValue`) and an ordered identity key
//!   (`EntityKey`).
//! - Report key shape mismatches as `KeyShapeError`.
//!
//! # Invariants
//! - `EntityKey` order follows the declared key field order of its entity.
//! - `EntityKey::encode()` is canonical: equal keys encode to equal strings.

use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Storage kind of one key field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Uuid,
    Integer,
    Text,
}

impl KeyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uuid => "uuid",
            Self::Integer => "integer",
            Self::Text => "text",
        }
    }
}

impl Display for KeyKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One key field value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyValue {
    Uuid(Uuid),
    Integer(i64),
    Text(String),
}

impl KeyValue {
    pub fn kind(&self) -> KeyKind {
        match self {
            Self::Uuid(_) => KeyKind::Uuid,
            Self::Integer(_) => KeyKind::Integer,
            Self::Text(_) => KeyKind::Text,
        }
    }

    /// Document representation of this value.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Uuid(value) => Value::String(value.to_string()),
            Self::Integer(value) => Value::from(*value),
            Self::Text(value) => Value::String(value.clone()),
        }
    }
}

impl Display for KeyValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uuid(value) => write!(f, "{value}"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "{value}"),
        }
    }
}

impl From<Uuid> for KeyValue {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl From<i64> for KeyValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for KeyValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Ordered identity key, one value per declared key field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey(Vec<KeyValue>);

impl EntityKey {
    pub fn new(values: Vec<KeyValue>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[KeyValue] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical text form used as the stored key column.
    ///
    /// Encoded as a JSON array, e.g. `["5f0c..."]` or `[7,"eu"]`.
    pub fn encode(&self) -> String {
        Value::Array(self.0.iter().map(KeyValue::to_json).collect()).to_string()
    }
}

impl Display for EntityKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let [single] = self.0.as_slice() {
            return write!(f, "{single}");
        }
        f.write_str("(")?;
        for (index, value) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{value}")?;
        }
        f.write_str(")")
    }
}

impl From<Vec<KeyValue>> for EntityKey {
    fn from(values: Vec<KeyValue>) -> Self {
        Self(values)
    }
}

impl From<KeyValue> for EntityKey {
    fn from(value: KeyValue) -> Self {
        Self(vec![value])
    }
}

impl From<Uuid> for EntityKey {
    fn from(value: Uuid) -> Self {
        Self(vec![value.into()])
    }
}

impl From<i64> for EntityKey {
    fn from(value: i64) -> Self {
        Self(vec![value.into()])
    }
}

impl From<&str> for EntityKey {
    fn from(value: &str) -> Self {
        Self(vec![value.into()])
    }
}

impl From<String> for EntityKey {
    fn from(value: String) -> Self {
        Self(vec![value.into()])
    }
}

impl<A, B> From<(A, B)> for EntityKey
where
    A: Into<KeyValue>,
    B: Into<KeyValue>,
{
    fn from((a, b): (A, B)) -> Self {
        Self(vec![a.into(), b.into()])
    }
}

impl<A, B, C> From<(A, B, C)> for EntityKey
where
    A: Into<KeyValue>,
    B: Into<KeyValue>,
    C: Into<KeyValue>,
{
    fn from((a, b, c): (A, B, C)) -> Self {
        Self(vec![a.into(), b.into(), c.into()])
    }
}

/// Key values do not match the declared key fields of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyShapeError {
    /// Number of key values differs from the number of key fields.
    ArityMismatch {
        entity: &'static str,
        expected: usize,
        actual: usize,
    },
    /// A key value has a different kind than its key field.
    KindMismatch {
        entity: &'static str,
        field: &'static str,
        expected: KeyKind,
        actual: KeyKind,
    },
    /// An assigned key field is missing or null in the document.
    MissingField {
        entity: &'static str,
        field: &'static str,
    },
    /// A generated key field has not been assigned yet.
    UnsetKey {
        entity: &'static str,
        field: &'static str,
    },
    /// A key field holds a value that cannot be read as its kind.
    InvalidValue {
        entity: &'static str,
        field: &'static str,
        message: String,
    },
}

impl KeyShapeError {
    /// Returns whether the only problem is a not-yet-generated key.
    pub fn is_unset(&self) -> bool {
        matches!(self, Self::UnsetKey { .. })
    }
}

impl Display for KeyShapeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ArityMismatch {
                entity,
                expected,
                actual,
            } => write!(
                f,
                "`{entity}` key expects {expected} value(s), got {actual}"
            ),
            Self::KindMismatch {
                entity,
                field,
                expected,
                actual,
            } => write!(
                f,
                "`{entity}.{field}` key expects {expected} value, got {actual}"
            ),
            Self::MissingField { entity, field } => {
                write!(f, "`{entity}.{field}` key field is missing")
            }
            Self::UnsetKey { entity, field } => {
                write!(f, "`{entity}.{field}` key has not been generated yet")
            }
            Self::InvalidValue {
                entity,
                field,
                message,
            } => write!(f, "`{entity}.{field}` key value is invalid: {message}"),
        }
    }
}

impl Error for KeyShapeError {}

#[cfg(test)]
mod tests {
    use super::{EntityKey, KeyKind, KeyValue};
    use uuid::Uuid;

    #[test]
    fn encode_is_canonical_json_array() {
        let key = EntityKey::from((7_i64, "eu"));
        assert_eq!(key.encode(), r#"[7,"eu"]"#);

        let id = Uuid::nil();
        assert_eq!(
            EntityKey::from(id).encode(),
            r#"["00000000-0000-0000-0000-000000000000"]"#
        );
    }

    #[test]
    fn display_wraps_composite_keys_only() {
        assert_eq!(EntityKey::from(42_i64).to_string(), "42");
        assert_eq!(EntityKey::from(("a", 2_i64)).to_string(), "(a, 2)");
    }

    #[test]
    fn conversions_keep_kinds() {
        let key = EntityKey::from((Uuid::new_v4(), 1_i32, String::from("x")));
        let kinds: Vec<KeyKind> = key.values().iter().map(KeyValue::kind).collect();
        assert_eq!(kinds, vec![KeyKind::Uuid, KeyKind::Integer, KeyKind::Text]);
    }
}
