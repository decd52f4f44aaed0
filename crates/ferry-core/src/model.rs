//! Records, identifiers and write operations exchanged between the record
//! stores, the entity handlers and the reconciler.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// RecordId
// ---------------------------------------------------------------------------

/// Identifier of a record inside one record system. Always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct RecordId(i64);

impl RecordId {
    /// Wrap a raw id, rejecting zero and negative values.
    #[must_use]
    pub const fn new(raw: i64) -> Option<Self> {
        if raw > 0 { Some(Self(raw)) } else { None }
    }

    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Extract an id from a field value.
    ///
    /// Accepts a positive integer or a many2one pair `[id, "display name"]`.
    /// `false`, `null`, strings and non-positive numbers yield `None`.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().and_then(Self::new),
            Value::Array(items) => match items.as_slice() {
                [Value::Number(n), Value::String(_)] => n.as_i64().and_then(Self::new),
                _ => None,
            },
            _ => None,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<RecordId> for i64 {
    fn from(id: RecordId) -> Self {
        id.0
    }
}

impl From<RecordId> for Value {
    fn from(id: RecordId) -> Self {
        Self::from(id.0)
    }
}

impl TryFrom<i64> for RecordId {
    type Error = InvalidRecordId;

    fn try_from(raw: i64) -> Result<Self, Self::Error> {
        Self::new(raw).ok_or_else(|| InvalidRecordId(raw.to_string()))
    }
}

impl FromStr for RecordId {
    type Err = InvalidRecordId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i64>()
            .ok()
            .and_then(Self::new)
            .ok_or_else(|| InvalidRecordId(s.to_string()))
    }
}

/// A string or number that is not a positive record id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("not a positive record id: '{0}'")]
pub struct InvalidRecordId(pub String);

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Field name → value, ordered by field name.
pub type Fields = BTreeMap<String, Value>;

/// Field values written to the destination.
pub type Payload = Fields;

/// A record read from the source system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: RecordId,
    pub fields: Fields,
}

impl SourceRecord {
    #[must_use]
    pub const fn new(id: RecordId, fields: Fields) -> Self {
        Self { id, fields }
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        if name == "id" {
            return None;
        }
        self.fields.get(name)
    }

    /// Destination id previously written to the back-reference field.
    #[must_use]
    pub fn back_reference(&self, field: &str) -> Option<RecordId> {
        self.fields.get(field).and_then(RecordId::from_value)
    }
}

/// True for the values Odoo uses to mean "no value".
#[must_use]
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Domain
// ---------------------------------------------------------------------------

/// One `field = value` condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Term {
    pub field: String,
    pub value: Value,
}

/// Conjunction of equality terms, used both as a page filter and as the
/// natural-key search of a record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    terms: Vec<Term>,
}

impl Domain {
    /// The empty domain matches every record.
    #[must_use]
    pub const fn new() -> Self {
        Self { terms: Vec::new() }
    }

    /// Single-term domain `field = value`.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new().and(field, value)
    }

    /// Add a `field = value` term.
    #[must_use]
    pub fn and(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.terms.push(Term {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    #[must_use]
    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Evaluate the domain against a record held in memory.
    ///
    /// Many2one values match either the pair itself or its bare id.
    #[must_use]
    pub fn matches(&self, id: RecordId, fields: &Fields) -> bool {
        self.terms.iter().all(|term| {
            if term.field == "id" {
                return RecordId::from_value(&term.value) == Some(id);
            }
            fields
                .get(&term.field)
                .is_some_and(|stored| values_match(stored, &term.value))
        })
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.terms.is_empty() {
            return write!(f, "[]");
        }
        let rendered: Vec<String> = self
            .terms
            .iter()
            .map(|term| format!("{} = {}", term.field, term.value))
            .collect();
        write!(f, "[{}]", rendered.join(" & "))
    }
}

fn values_match(stored: &Value, wanted: &Value) -> bool {
    if stored == wanted {
        return true;
    }
    match (RecordId::from_value(stored), RecordId::from_value(wanted)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// What the reconciler should do with a transformed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
        }
    }
}

/// A destination write planned by an entity handler. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    pub action: Action,
    pub entity_type: String,
    pub source_id: RecordId,
    pub payload: Payload,
    /// Destination-side search identifying the same real-world record.
    pub natural_key: Domain,
    /// Destination id read from the source record's back-reference field.
    pub back_reference: Option<RecordId>,
}

/// The durable fact that `source_id` produced `dest_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Correlation<'a> {
    pub entity_type: &'a str,
    pub source_id: RecordId,
    pub dest_id: RecordId,
}
