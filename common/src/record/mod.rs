use std::fmt;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Composite primary-store key. The range component is optional; records in a
/// hash-only collection leave it unset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<String>,
}

impl RecordKey {
    pub fn hash_only(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            range: None,
        }
    }

    pub fn composite(hash: impl Into<String>, range: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            range: Some(range.into()),
        }
    }

    /// Identifier function used to derive cache keys for a single record.
    pub fn cache_id(&self) -> String {
        match &self.range {
            Some(range) => format!("{}/{}", self.hash, range),
            None => self.hash.clone(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cache_id())
    }
}

/// Declared storage representation of a record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    I64,
    I32,
    I16,
    F64,
    F32,
    Text,
    Bool,
    Timestamp,
}

impl FieldKind {
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            FieldKind::I64 | FieldKind::I32 | FieldKind::I16 | FieldKind::F64 | FieldKind::F32
        )
    }
}

/// Runtime value extracted from a record through its schema descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    I64(i64),
    I32(i32),
    I16(i16),
    F64(f64),
    F32(f32),
    Text(String),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

/// One row of a record type's static schema table: field name, declared
/// storage kind and a typed accessor. Built at compile time, so no runtime
/// reflection is involved in query validation or filter evaluation.
pub struct FieldSpec<R> {
    pub name: &'static str,
    pub kind: FieldKind,
    pub get: fn(&R) -> FieldValue,
}

/// Capabilities a type needs to live in the repository layer: a collection
/// name, a composite key, an etag slot, audit timestamps and a schema table.
///
/// Serialization contract: the etag must serialize under the field name
/// `etag` and the update timestamp under `updated_at`, since both are
/// excluded from etag canonicalization. Domain fields should tolerate being
/// absent (serde defaults) so projected documents can round-trip.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn collection() -> &'static str;

    /// Type name used in hash-map cache keys. Defaults to the collection name.
    fn type_name() -> &'static str {
        Self::collection()
    }

    fn key(&self) -> RecordKey;

    fn etag(&self) -> &str;

    fn set_etag(&mut self, etag: String);

    fn created_at(&self) -> DateTime<Utc>;

    fn set_created_at(&mut self, at: DateTime<Utc>);

    /// Refresh the update timestamp. Called on every successful write.
    fn touch(&mut self, at: DateTime<Utc>);

    fn schema() -> &'static [FieldSpec<Self>];

    fn field(name: &str) -> Option<&'static FieldSpec<Self>> {
        Self::schema().iter().find(|spec| spec.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_id_for_hash_only_key() {
        let key = RecordKey::hash_only("abc");
        assert_eq!(key.cache_id(), "abc");
    }

    #[test]
    fn cache_id_for_composite_key() {
        let key = RecordKey::composite("abc", "2024-01-01");
        assert_eq!(key.cache_id(), "abc/2024-01-01");
    }

    #[test]
    fn record_key_ordering_follows_hash_then_range() {
        let a = RecordKey::composite("a", "1");
        let b = RecordKey::composite("a", "2");
        let c = RecordKey::hash_only("b");
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn numeric_kinds() {
        assert!(FieldKind::I16.is_numeric());
        assert!(FieldKind::F32.is_numeric());
        assert!(!FieldKind::Text.is_numeric());
        assert!(!FieldKind::Timestamp.is_numeric());
    }
}
