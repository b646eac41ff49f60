use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::marker::PhantomData;

use common::error::{DataApiError, FieldError, FieldErrors};
use common::record::{FieldKind, FieldValue, Record, RecordKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::etag::digest_hex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

/// Validated description of a list query. Construct through
/// [`QuerySpecBuilder`], which checks every referenced field against the
/// record schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct QuerySpec {
    pub filters: Vec<Filter>,
    pub ordering: Vec<(String, SortDirection)>,
    pub limit: Option<usize>,
    pub projection: Option<BTreeSet<String>>,
}

impl QuerySpec {
    /// Stable fingerprint of the whole spec. Page tokens embed it so a cursor
    /// replayed against a different query fails instead of returning wrong
    /// results.
    pub fn fingerprint(&self) -> String {
        // Plain data with string keys; serialization cannot fail.
        #[allow(clippy::expect_used)]
        let serialized = serde_json::to_vec(self).expect("query spec serializes to JSON");
        digest_hex(&serialized)
    }

    /// True when the document passes every filter. A missing field never
    /// matches.
    pub fn matches(&self, document: &Value) -> bool {
        self.filters.iter().all(|filter| {
            let Some(actual) = document.get(&filter.field) else {
                return false;
            };
            evaluate(filter.op, actual, &filter.value)
        })
    }

    /// Orders documents in place by the spec's ordering keys.
    pub fn sort_documents(&self, documents: &mut [(RecordKey, Value)]) {
        if self.ordering.is_empty() {
            return;
        }
        documents.sort_by(|a, b| {
            for (field, direction) in &self.ordering {
                let ordering = compare(a.1.get(field), b.1.get(field));
                let ordering = match direction {
                    SortDirection::Ascending => ordering,
                    SortDirection::Descending => ordering.reverse(),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
    }

    pub fn apply_projection<R: Record>(&self, document: &Value) -> Value {
        match &self.projection {
            Some(projection) => project_document::<R>(document, projection),
            None => document.clone(),
        }
    }
}

/// Strips a document down to the projected fields. Fields that are not part
/// of the record schema (key, etag, timestamps) are always retained so the
/// result still deserializes as the record type.
pub fn project_document<R: Record>(document: &Value, projection: &BTreeSet<String>) -> Value {
    let Value::Object(fields) = document else {
        return document.clone();
    };
    let projected = fields
        .iter()
        .filter(|(name, _)| projection.contains(name.as_str()) || R::field(name).is_none())
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    Value::Object(projected)
}

fn evaluate(op: FilterOp, actual: &Value, expected: &Value) -> bool {
    match op {
        FilterOp::Eq => values_equal(actual, expected),
        FilterOp::Ne => !values_equal(actual, expected),
        FilterOp::Lt => compare_values(actual, expected) == Some(Ordering::Less),
        FilterOp::Le => matches!(
            compare_values(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        FilterOp::Gt => compare_values(actual, expected) == Some(Ordering::Greater),
        FilterOp::Ge => matches!(
            compare_values(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        FilterOp::Contains => match (actual.as_str(), expected.as_str()) {
            (Some(haystack), Some(needle)) => haystack.contains(needle),
            _ => false,
        },
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) {
        return (a - b).abs() < f64::EPSILON;
    }
    a == b
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) {
        return a.partial_cmp(&b);
    }
    if let (Some(a), Some(b)) = (a.as_str(), b.as_str()) {
        return Some(a.cmp(b));
    }
    None
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => compare_values(a, b).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

type NumericExtractor = fn(&FieldValue) -> Option<f64>;

fn extract_i64(value: &FieldValue) -> Option<f64> {
    match value {
        FieldValue::I64(v) => Some(*v as f64),
        _ => None,
    }
}

fn extract_i32(value: &FieldValue) -> Option<f64> {
    match value {
        FieldValue::I32(v) => Some(f64::from(*v)),
        _ => None,
    }
}

fn extract_i16(value: &FieldValue) -> Option<f64> {
    match value {
        FieldValue::I16(v) => Some(f64::from(*v)),
        _ => None,
    }
}

fn extract_f64(value: &FieldValue) -> Option<f64> {
    match value {
        FieldValue::F64(v) => Some(*v),
        _ => None,
    }
}

fn extract_f32(value: &FieldValue) -> Option<f64> {
    match value {
        FieldValue::F32(v) => Some(f64::from(*v)),
        _ => None,
    }
}

/// Resolution order for numeric storage representations: integer widths
/// descending, then floating point. The first successful extraction wins.
const NUMERIC_EXTRACTORS: [NumericExtractor; 5] = [
    extract_i64,
    extract_i32,
    extract_i16,
    extract_f64,
    extract_f32,
];

pub fn coerce_numeric(value: &FieldValue) -> Option<f64> {
    NUMERIC_EXTRACTORS
        .iter()
        .find_map(|extractor| extractor(value))
}

/// Reads a field through the schema accessor and coerces it to a comparable
/// number. Exhausting every extractor reports the field as unreadable.
pub fn read_numeric_field<R: Record>(record: &R, field: &str) -> Result<f64, FieldError> {
    let spec = R::field(field).ok_or_else(|| FieldError::new(field, "unknown field"))?;
    coerce_numeric(&(spec.get)(record))
        .ok_or_else(|| FieldError::new(field, "field is not readable as a number"))
}

/// Builds a [`QuerySpec`] from raw filter expressions, validating every
/// referenced field against the record schema. Violations are collected and
/// reported together instead of failing on the first one.
pub struct QuerySpecBuilder<R: Record> {
    filters: Vec<Filter>,
    ordering: Vec<(String, SortDirection)>,
    limit: Option<usize>,
    projection: Option<BTreeSet<String>>,
    _record: PhantomData<R>,
}

impl<R: Record> Default for QuerySpecBuilder<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Record> QuerySpecBuilder<R> {
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
            ordering: Vec::new(),
            limit: None,
            projection: None,
            _record: PhantomData,
        }
    }

    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: Value) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op,
            value,
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.ordering.push((field.into(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn project<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn build(self) -> Result<QuerySpec, DataApiError> {
        let mut errors = FieldErrors::default();

        for filter in &self.filters {
            match R::field(&filter.field) {
                None => errors.push(FieldError::new(&filter.field, "unknown field")),
                Some(spec) => {
                    if let Err(message) = validate_filter(spec.kind, filter.op, &filter.value) {
                        errors.push(FieldError::new(&filter.field, message));
                    }
                }
            }
        }
        for (field, _) in &self.ordering {
            if R::field(field).is_none() {
                errors.push(FieldError::new(field, "unknown ordering field"));
            }
        }
        if let Some(projection) = &self.projection {
            for field in projection {
                if R::field(field).is_none() {
                    errors.push(FieldError::new(field, "unknown projection field"));
                }
            }
        }
        if self.limit == Some(0) {
            errors.push(FieldError::new("limit", "limit must be positive"));
        }

        if errors.is_empty() {
            Ok(QuerySpec {
                filters: self.filters,
                ordering: self.ordering,
                limit: self.limit,
                projection: self.projection,
            })
        } else {
            Err(DataApiError::Validation(errors))
        }
    }
}

fn validate_filter(kind: FieldKind, op: FilterOp, value: &Value) -> Result<(), String> {
    if op == FilterOp::Contains && kind != FieldKind::Text {
        return Err("contains requires a text field".to_string());
    }
    if kind == FieldKind::Bool && !matches!(op, FilterOp::Eq | FilterOp::Ne) {
        return Err("boolean fields only support equality".to_string());
    }

    let readable = match kind {
        FieldKind::I64 => value.as_i64().is_some(),
        FieldKind::I32 => value.as_i64().and_then(|v| i32::try_from(v).ok()).is_some(),
        FieldKind::I16 => value.as_i64().and_then(|v| i16::try_from(v).ok()).is_some(),
        FieldKind::F64 | FieldKind::F32 => value.as_f64().is_some(),
        FieldKind::Text => value.is_string(),
        FieldKind::Bool => value.is_boolean(),
        FieldKind::Timestamp => value
            .as_str()
            .is_some_and(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok()),
    };
    if readable {
        Ok(())
    } else {
        Err(format!("filter value is not readable as {kind:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_support::Track;
    use serde_json::json;

    fn documents() -> Vec<(RecordKey, Value)> {
        vec![
            (
                RecordKey::hash_only("a"),
                json!({"id": "a", "title": "Alpha", "plays": 10, "rating": 3.0}),
            ),
            (
                RecordKey::hash_only("b"),
                json!({"id": "b", "title": "Beta", "plays": 5, "rating": 4.5}),
            ),
            (
                RecordKey::hash_only("c"),
                json!({"id": "c", "title": "Gamma", "plays": 20, "rating": 1.0}),
            ),
        ]
    }

    #[test]
    fn fingerprint_is_stable_and_query_sensitive() {
        let spec_a = QuerySpecBuilder::<Track>::new()
            .filter("plays", FilterOp::Ge, json!(5))
            .build()
            .expect("spec");
        let spec_b = QuerySpecBuilder::<Track>::new()
            .filter("plays", FilterOp::Ge, json!(5))
            .build()
            .expect("spec");
        let spec_c = QuerySpecBuilder::<Track>::new()
            .filter("plays", FilterOp::Ge, json!(6))
            .build()
            .expect("spec");

        assert_eq!(spec_a.fingerprint(), spec_b.fingerprint());
        assert_ne!(spec_a.fingerprint(), spec_c.fingerprint());
    }

    #[test]
    fn numeric_and_text_filters_match_documents() {
        let spec = QuerySpecBuilder::<Track>::new()
            .filter("plays", FilterOp::Ge, json!(10))
            .build()
            .expect("spec");
        let matched: Vec<_> = documents()
            .into_iter()
            .filter(|(_, doc)| spec.matches(doc))
            .collect();
        assert_eq!(matched.len(), 2);

        let spec = QuerySpecBuilder::<Track>::new()
            .filter("title", FilterOp::Contains, json!("am"))
            .build()
            .expect("spec");
        let matched: Vec<_> = documents()
            .into_iter()
            .filter(|(_, doc)| spec.matches(doc))
            .collect();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].0, RecordKey::hash_only("c"));
    }

    #[test]
    fn missing_field_never_matches() {
        let spec = QuerySpecBuilder::<Track>::new()
            .filter("plays", FilterOp::Ge, json!(0))
            .build()
            .expect("spec");
        assert!(!spec.matches(&json!({"id": "x"})));
    }

    #[test]
    fn ordering_sorts_documents() {
        let spec = QuerySpecBuilder::<Track>::new()
            .order_by("plays", SortDirection::Descending)
            .build()
            .expect("spec");
        let mut docs = documents();
        spec.sort_documents(&mut docs);
        let plays: Vec<i64> = docs
            .iter()
            .map(|(_, doc)| doc["plays"].as_i64().unwrap_or_default())
            .collect();
        assert_eq!(plays, vec![20, 10, 5]);
    }

    #[test]
    fn projection_retains_non_schema_fields() {
        let projection: BTreeSet<String> = ["title".to_string()].into();
        let document = json!({
            "id": "a",
            "etag": "abc",
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z",
            "title": "Alpha",
            "artist": "Someone",
            "plays": 10
        });
        let projected = project_document::<Track>(&document, &projection);
        assert_eq!(projected["title"], json!("Alpha"));
        assert_eq!(projected["id"], json!("a"));
        assert_eq!(projected["etag"], json!("abc"));
        assert!(projected.get("artist").is_none());
        assert!(projected.get("plays").is_none());
    }

    #[test]
    fn builder_collects_every_violation() {
        let result = QuerySpecBuilder::<Track>::new()
            .filter("unknown_field", FilterOp::Eq, json!(1))
            .filter("plays", FilterOp::Eq, json!("not a number"))
            .filter("title", FilterOp::Contains, json!("x"))
            .order_by("also_unknown", SortDirection::Ascending)
            .project(["title", "missing_projection"])
            .build();

        let Err(DataApiError::Validation(errors)) = result else {
            panic!("expected validation failure");
        };
        assert_eq!(errors.len(), 4);
        let fields: Vec<&str> = errors.0.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"unknown_field"));
        assert!(fields.contains(&"plays"));
        assert!(fields.contains(&"also_unknown"));
        assert!(fields.contains(&"missing_projection"));
    }

    #[test]
    fn zero_limit_is_rejected() {
        let result = QuerySpecBuilder::<Track>::new().limit(0).build();
        let Err(DataApiError::Validation(errors)) = result else {
            panic!("expected validation failure");
        };
        assert_eq!(errors.len(), 1);
        assert_eq!(errors.0[0].field, "limit");
    }

    #[test]
    fn narrow_integer_widths_reject_out_of_range_values() {
        let result = QuerySpecBuilder::<Track>::new()
            .filter("position", FilterOp::Eq, json!(70_000))
            .build();
        assert!(matches!(result, Err(DataApiError::Validation(_))));

        let ok = QuerySpecBuilder::<Track>::new()
            .filter("position", FilterOp::Eq, json!(7))
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn contains_on_non_text_field_is_rejected() {
        let result = QuerySpecBuilder::<Track>::new()
            .filter("plays", FilterOp::Contains, json!(5))
            .build();
        assert!(matches!(result, Err(DataApiError::Validation(_))));
    }

    #[test]
    fn numeric_coercion_resolves_every_width() {
        assert_eq!(coerce_numeric(&FieldValue::I64(7)), Some(7.0));
        assert_eq!(coerce_numeric(&FieldValue::I32(7)), Some(7.0));
        assert_eq!(coerce_numeric(&FieldValue::I16(7)), Some(7.0));
        assert_eq!(coerce_numeric(&FieldValue::F64(7.5)), Some(7.5));
        assert_eq!(coerce_numeric(&FieldValue::F32(0.5)), Some(0.5));
        assert_eq!(coerce_numeric(&FieldValue::Text("7".into())), None);
        assert_eq!(coerce_numeric(&FieldValue::Bool(true)), None);
    }

    #[test]
    fn unreadable_numeric_field_is_reported() {
        let track = Track::new("Alpha", "Someone");
        assert!(read_numeric_field(&track, "plays").is_ok());

        let err = read_numeric_field(&track, "title").expect_err("text field");
        assert_eq!(err.field, "title");

        let err = read_numeric_field(&track, "nope").expect_err("unknown field");
        assert_eq!(err.field, "nope");
    }
}
