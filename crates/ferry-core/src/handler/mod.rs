//! Per-entity-type record transformation.
//!
//! An [`EntityHandler`] turns one source record into the destination writes
//! it implies. Handlers never write anything themselves: they resolve
//! foreign keys through the [`MappingStore`] and ask the destination whether
//! the record already exists, then hand [`PendingOperation`]s to the
//! [`Reconciler`](crate::reconcile::Reconciler).

pub mod builtin;
pub mod mapped;
pub mod registry;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MigrateError, TransportError};
use crate::mapping::MappingStore;
use crate::model::{Domain, Payload, PendingOperation, RecordId, SourceRecord, is_empty_value};
use crate::reconcile::Reconciler;

pub use mapped::{EntitySpec, FieldRule, MappedHandler};
pub use registry::{HandlerFactory, HandlerRegistry, HandlerSettings};

// ---------------------------------------------------------------------------
// NaturalKey
// ---------------------------------------------------------------------------

/// Destination fields whose combined values identify the same real-world
/// record in both systems.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalKey {
    fields: Vec<String>,
}

impl NaturalKey {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    #[must_use]
    pub fn contains(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f == field)
    }

    /// Key fields that are absent or empty in `payload`.
    #[must_use]
    pub fn missing_fields<'a>(&'a self, payload: &Payload) -> Vec<&'a str> {
        self.fields
            .iter()
            .filter(|field| payload.get(field.as_str()).is_none_or(is_empty_value))
            .map(String::as_str)
            .collect()
    }

    /// Destination search for the record `payload` describes, or `None` when
    /// a key field has no value.
    #[must_use]
    pub fn domain_for(&self, payload: &Payload) -> Option<Domain> {
        if self.fields.is_empty() || !self.missing_fields(payload).is_empty() {
            return None;
        }
        let mut domain = Domain::new();
        for field in &self.fields {
            let value = payload.get(field)?;
            domain = domain.and(field.clone(), search_value(value));
        }
        Some(domain)
    }
}

/// Many2one pairs are searched by their id.
fn search_value(value: &Value) -> Value {
    match value {
        Value::Array(_) => RecordId::from_value(value).map_or_else(|| value.clone(), Into::into),
        _ => value.clone(),
    }
}

// ---------------------------------------------------------------------------
// EntityHandler
// ---------------------------------------------------------------------------

/// Transformation contract for one entity type.
pub trait EntityHandler {
    fn entity_type(&self) -> &str;

    fn natural_key(&self) -> &NaturalKey;

    /// Entity types whose mapping tables this handler reads. They must be
    /// migrated first.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Plan the destination writes for one source record.
    ///
    /// # Errors
    ///
    /// [`MigrateError::ResourceNotFound`] when this record cannot be resolved
    /// (the pipeline skips it) or [`MigrateError::Transport`] when the
    /// destination cannot be queried (the pipeline abandons the entity type).
    fn transform(
        &self,
        record: &SourceRecord,
        ctx: &mut TransformContext<'_, '_>,
    ) -> Result<Vec<PendingOperation>, MigrateError>;
}

// ---------------------------------------------------------------------------
// TransformContext
// ---------------------------------------------------------------------------

/// What a handler may consult while transforming a record.
pub struct TransformContext<'r, 'm> {
    reconciler: &'r Reconciler<'r>,
    mappings: &'m mut MappingStore,
}

impl<'r, 'm> TransformContext<'r, 'm> {
    pub const fn new(reconciler: &'r Reconciler<'r>, mappings: &'m mut MappingStore) -> Self {
        Self {
            reconciler,
            mappings,
        }
    }

    /// Destination id of an already-migrated record of `entity_type`.
    pub fn resolve(&mut self, entity_type: &str, source_id: RecordId) -> Option<RecordId> {
        self.mappings.get(entity_type, source_id)
    }

    /// Ask the destination whether a record matching `key` exists.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the destination cannot be queried.
    pub fn exists_in_destination(
        &self,
        entity_type: &str,
        key: &Domain,
    ) -> Result<bool, TransportError> {
        self.reconciler.exists_in_destination(entity_type, key)
    }

    /// Destination id stored on the source record by an earlier run.
    #[must_use]
    pub fn back_reference(&self, record: &SourceRecord) -> Option<RecordId> {
        record.back_reference(self.reconciler.back_reference_field())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(pairs: &[(&str, Value)]) -> Payload {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn domain_for_builds_conjunction_in_key_order() {
        let key = NaturalKey::new(["name", "email"]);
        let domain = key
            .domain_for(&payload(&[
                ("email", json!("a@x.com")),
                ("name", json!("Alice")),
                ("phone", json!("555")),
            ]))
            .expect("complete key");
        assert_eq!(domain.to_string(), "[name = \"Alice\" & email = \"a@x.com\"]");
    }

    #[test]
    fn domain_for_rejects_missing_or_empty_fields() {
        let key = NaturalKey::new(["login"]);
        assert!(key.domain_for(&payload(&[])).is_none());
        assert!(key.domain_for(&payload(&[("login", json!(false))])).is_none());
        assert_eq!(key.missing_fields(&payload(&[("login", json!(""))])), vec!["login"]);
    }

    #[test]
    fn many2one_key_values_search_by_id() {
        let key = NaturalKey::new(["attribute_id"]);
        let domain = key
            .domain_for(&payload(&[("attribute_id", json!([4, "Color"]))]))
            .expect("key");
        assert_eq!(domain.terms()[0].value, json!(4));
    }

    #[test]
    fn empty_key_never_matches() {
        let key = NaturalKey::new(Vec::<String>::new());
        assert!(key.domain_for(&payload(&[("name", json!("x"))])).is_none());
    }
}
