//! Payload value model shared by records, entities and edge attributes.
//!
//! A field holds either a single scalar or an ordered list of scalars.
//! `merge` accumulates values without ever discarding one, so an entity
//! that is registered from several records keeps everything it was told.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Scalar / Value
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scalar {
    Text(String),
    Integer(i64),
    Number(f64),
    Date(NaiveDate),
}

impl Scalar {
    /// Textual form used for key normalisation and id lookups.
    pub fn to_key_string(&self) -> String {
        match self {
            Scalar::Text(s) => s.clone(),
            Scalar::Integer(i) => i.to_string(),
            Scalar::Number(n) => n.to_string(),
            Scalar::Date(d) => d.format("%Y-%m-%d").to_string(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Blank text counts as "no value" when deciding whether a record is empty.
    pub fn is_blank(&self) -> bool {
        matches!(self, Scalar::Text(s) if s.trim().is_empty())
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_key_string())
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self { Scalar::Text(s.to_string()) }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self { Scalar::Text(s) }
}

impl From<i64> for Scalar {
    fn from(i: i64) -> Self { Scalar::Integer(i) }
}

impl From<f64> for Scalar {
    fn from(n: f64) -> Self { Scalar::Number(n) }
}

impl From<NaiveDate> for Scalar {
    fn from(d: NaiveDate) -> Self { Scalar::Date(d) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Scalar(Scalar),
    List(Vec<Scalar>),
}

impl Value {
    /// View the value as a slice of scalars regardless of its shape.
    pub fn scalars(&self) -> &[Scalar] {
        match self {
            Value::Scalar(s) => std::slice::from_ref(s),
            Value::List(items) => items,
        }
    }

    pub fn first(&self) -> Option<&Scalar> {
        self.scalars().first()
    }

    pub fn len(&self) -> usize {
        self.scalars().len()
    }

    pub fn is_empty(&self) -> bool {
        self.scalars().iter().all(Scalar::is_blank)
    }

    pub fn list<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Scalar>,
    {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl From<Scalar> for Value {
    fn from(s: Scalar) -> Self { Value::Scalar(s) }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self { Value::Scalar(s.into()) }
}

impl From<String> for Value {
    fn from(s: String) -> Self { Value::Scalar(s.into()) }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self { Value::Scalar(i.into()) }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self { Value::Scalar(n.into()) }
}

impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self { Value::Scalar(d.into()) }
}

impl From<Vec<Scalar>> for Value {
    fn from(items: Vec<Scalar>) -> Self { Value::List(items) }
}

/// Accumulate `incoming` onto `existing` without losing anything.
///
/// scalar + scalar -> ordered pair; list + scalar -> append;
/// scalar + list -> prepend; list + list -> concatenation.
/// Duplicates are kept; callers that want set semantics dedup first.
pub fn merge(existing: Value, incoming: Value) -> Value {
    match (existing, incoming) {
        (Value::Scalar(a), Value::Scalar(b)) => Value::List(vec![a, b]),
        (Value::List(mut items), Value::Scalar(b)) => {
            items.push(b);
            Value::List(items)
        }
        (Value::Scalar(a), Value::List(rest)) => {
            let mut items = Vec::with_capacity(rest.len() + 1);
            items.push(a);
            items.extend(rest);
            Value::List(items)
        }
        (Value::List(mut items), Value::List(rest)) => {
            items.extend(rest);
            Value::List(items)
        }
    }
}

/// Merged property map of an entity (or attribute map of an edge).
pub type Payload = BTreeMap<String, Value>;

/// Merge every field of `incoming` into `target`.
/// Fields only present on one side are kept unchanged.
pub fn merge_payload(target: &mut Payload, incoming: &Payload) {
    for (field, value) in incoming {
        let merged = match target.remove(field) {
            Some(old) => merge(old, value.clone()),
            None => value.clone(),
        };
        target.insert(field.clone(), merged);
    }
}

// ---------------------------------------------------------------------------
// Field diagnostics
// ---------------------------------------------------------------------------

/// Typed reason a field was left out of a record during extraction.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldDiagnostic {
    BadDate { field: String, raw: String },
    BadNumber { field: String, raw: String },
    MissingAttribute { field: String, attribute: String },
    RejectedKey { field: String, raw: String, reason: String },
}

impl fmt::Display for FieldDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldDiagnostic::BadDate { field, raw } => write!(f, "{field}: bad date {raw:?}"),
            FieldDiagnostic::BadNumber { field, raw } => write!(f, "{field}: bad number {raw:?}"),
            FieldDiagnostic::MissingAttribute { field, attribute } => {
                write!(f, "{field}: missing attribute {attribute:?}")
            }
            FieldDiagnostic::RejectedKey { field, raw, reason } => {
                write!(f, "{field}: rejected key value {raw:?} ({reason})")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RawRecord
// ---------------------------------------------------------------------------

/// One transient input document/row as produced by a source adapter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecord {
    fields: Payload,
    diagnostics: Vec<FieldDiagnostic>,
}

impl RawRecord {
    pub fn new() -> Self { Self::default() }

    /// Set a field, replacing any previous value.
    pub fn put(&mut self, field: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Append a scalar to a field, turning it into a list on the second call.
    pub fn push(&mut self, field: impl Into<String>, value: impl Into<Scalar>) -> &mut Self {
        let field = field.into();
        let value = Value::Scalar(value.into());
        let merged = match self.fields.remove(&field) {
            Some(old) => merge(old, value),
            None => value,
        };
        self.fields.insert(field, merged);
        self
    }

    /// Parse and set a date field; a malformed date is recorded and the field omitted.
    pub fn put_date(&mut self, field: &str, raw: &str, format: &str) -> Option<NaiveDate> {
        match NaiveDate::parse_from_str(raw.trim(), format) {
            Ok(date) => {
                self.put(field, date);
                Some(date)
            }
            Err(_) => {
                self.diagnostics.push(FieldDiagnostic::BadDate {
                    field: field.to_string(),
                    raw: raw.to_string(),
                });
                None
            }
        }
    }

    /// Parse and set an integer field; a malformed number is recorded and the field omitted.
    pub fn put_integer(&mut self, field: &str, raw: &str) -> Option<i64> {
        match raw.trim().parse::<i64>() {
            Ok(v) => {
                self.put(field, v);
                Some(v)
            }
            Err(_) => {
                self.diagnostics.push(FieldDiagnostic::BadNumber {
                    field: field.to_string(),
                    raw: raw.to_string(),
                });
                None
            }
        }
    }

    pub fn put_number(&mut self, field: &str, raw: &str) -> Option<f64> {
        match raw.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => {
                self.put(field, v);
                Some(v)
            }
            _ => {
                self.diagnostics.push(FieldDiagnostic::BadNumber {
                    field: field.to_string(),
                    raw: raw.to_string(),
                });
                None
            }
        }
    }

    pub fn note(&mut self, diagnostic: FieldDiagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    pub fn fields(&self) -> &Payload {
        &self.fields
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn diagnostics(&self) -> &[FieldDiagnostic] {
        &self.diagnostics
    }

    /// True when no field carries a non-blank value.
    pub fn is_empty(&self) -> bool {
        self.fields.values().all(Value::is_empty)
    }

    pub fn into_payload(self) -> Payload {
        self.fields
    }
}

impl From<Payload> for RawRecord {
    fn from(fields: Payload) -> Self {
        Self { fields, diagnostics: Vec::new() }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for RawRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = RawRecord::new();
        for (k, v) in iter {
            record.put(k, v);
        }
        record
    }
}
