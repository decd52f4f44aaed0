//! Declarative entity handler.
//!
//! A [`MappedHandler`] is driven by an [`EntitySpec`]: a natural key plus a
//! list of [`FieldRule`]s. Built-in entity types and `[[entities]]` blocks in
//! `ferry.toml` both compile down to one.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use crate::error::MigrateError;
use crate::handler::{EntityHandler, HandlerSettings, NaturalKey, TransformContext};
use crate::model::{Action, Payload, PendingOperation, RecordId, SourceRecord, is_empty_value};

/// Odoo x2many command replacing the whole set: `(6, 0, ids)`.
const REPLACE_SET_COMMAND: i64 = 6;

// ---------------------------------------------------------------------------
// EntitySpec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySpec {
    /// Entity type name, e.g. `res.partner`.
    pub name: String,
    pub natural_key: Vec<String>,
    #[serde(default)]
    pub fields: Vec<FieldRule>,
    /// Fields written on update. `None` writes the full payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_fields: Option<Vec<String>>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl EntitySpec {
    pub fn new<I, S>(name: impl Into<String>, natural_key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            natural_key: natural_key.into_iter().map(Into::into).collect(),
            fields: Vec::new(),
            update_fields: None,
            depends_on: Vec::new(),
        }
    }

    #[must_use]
    pub fn field(mut self, rule: FieldRule) -> Self {
        self.fields.push(rule);
        self
    }

    /// Copy each named field under the same name.
    #[must_use]
    pub fn copy_fields(mut self, names: &[&str]) -> Self {
        self.fields.extend(names.iter().map(|name| FieldRule::copy(name)));
        self
    }
}

/// How one destination field is produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldRule {
    /// Copy the source value verbatim.
    Copy { source: String, dest: String },
    /// Write a fixed value.
    Constant { dest: String, value: Value },
    /// Translate a many2one through `target`'s mapping table.
    Reference {
        source: String,
        dest: String,
        target: String,
    },
    /// Translate a many2many id list through `target`'s mapping table.
    ReferenceSet {
        source: String,
        dest: String,
        target: String,
    },
}

impl FieldRule {
    #[must_use]
    pub fn copy(name: &str) -> Self {
        Self::Copy {
            source: name.to_string(),
            dest: name.to_string(),
        }
    }

    #[must_use]
    pub fn reference(name: &str, target: &str) -> Self {
        Self::Reference {
            source: name.to_string(),
            dest: name.to_string(),
            target: target.to_string(),
        }
    }

    #[must_use]
    pub fn reference_set(name: &str, target: &str) -> Self {
        Self::ReferenceSet {
            source: name.to_string(),
            dest: name.to_string(),
            target: target.to_string(),
        }
    }

    #[must_use]
    pub fn dest(&self) -> &str {
        match self {
            Self::Copy { dest, .. }
            | Self::Constant { dest, .. }
            | Self::Reference { dest, .. }
            | Self::ReferenceSet { dest, .. } => dest,
        }
    }

    /// Entity type this rule resolves ids against.
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Reference { target, .. } | Self::ReferenceSet { target, .. } => Some(target),
            Self::Copy { .. } | Self::Constant { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// MappedHandler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MappedHandler {
    spec: EntitySpec,
    natural_key: NaturalKey,
    legacy_id_field: Option<String>,
}

impl MappedHandler {
    #[must_use]
    pub fn new(spec: EntitySpec, settings: &HandlerSettings) -> Self {
        let natural_key = NaturalKey::new(spec.natural_key.iter().cloned());
        Self {
            spec,
            natural_key,
            legacy_id_field: settings.legacy_id_field.clone(),
        }
    }

    #[must_use]
    pub const fn spec(&self) -> &EntitySpec {
        &self.spec
    }

    fn build_payload(
        &self,
        record: &SourceRecord,
        ctx: &mut TransformContext<'_, '_>,
    ) -> Result<Payload, MigrateError> {
        let mut payload = Payload::new();

        for rule in &self.spec.fields {
            match rule {
                FieldRule::Copy { source, dest } => {
                    if let Some(value) = record.field(source) {
                        payload.insert(dest.clone(), value.clone());
                    }
                }
                FieldRule::Constant { dest, value } => {
                    payload.insert(dest.clone(), value.clone());
                }
                FieldRule::Reference {
                    source,
                    dest,
                    target,
                } => {
                    let Some(value) = record.field(source) else {
                        continue;
                    };
                    if is_empty_value(value) {
                        payload.insert(dest.clone(), Value::Bool(false));
                        continue;
                    }
                    let referenced = RecordId::from_value(value).ok_or_else(|| {
                        self.not_found(record, format!("{source} holds no record id: {value}"))
                    })?;
                    let dest_id = ctx.resolve(target, referenced).ok_or_else(|| {
                        self.not_found(
                            record,
                            format!("{source} points at {target} record {referenced}, which is not migrated"),
                        )
                    })?;
                    payload.insert(dest.clone(), Value::from(dest_id));
                }
                FieldRule::ReferenceSet {
                    source,
                    dest,
                    target,
                } => {
                    let Some(Value::Array(members)) = record.field(source) else {
                        continue;
                    };
                    let mut ids = Vec::with_capacity(members.len());
                    for member in members {
                        let Some(referenced) = RecordId::from_value(member) else {
                            continue;
                        };
                        match ctx.resolve(target, referenced) {
                            Some(dest_id) => ids.push(dest_id.get()),
                            None => warn!(
                                entity_type = %self.spec.name,
                                source_id = %record.id,
                                field = %source,
                                target = %target,
                                %referenced,
                                "unmapped set member dropped"
                            ),
                        }
                    }
                    payload.insert(dest.clone(), json!([[REPLACE_SET_COMMAND, 0, ids]]));
                }
            }
        }

        Ok(payload)
    }

    fn not_found(&self, record: &SourceRecord, reason: String) -> MigrateError {
        MigrateError::not_found(&self.spec.name, record.id, reason)
    }

    /// Reduce an update payload to `update_fields` plus the key fields.
    fn update_payload(&self, mut payload: Payload) -> Payload {
        if let Some(allowed) = &self.spec.update_fields {
            payload.retain(|field, _| {
                allowed.iter().any(|f| f == field) || self.natural_key.contains(field)
            });
        }
        payload
    }
}

impl EntityHandler for MappedHandler {
    fn entity_type(&self) -> &str {
        &self.spec.name
    }

    fn natural_key(&self) -> &NaturalKey {
        &self.natural_key
    }

    fn dependencies(&self) -> Vec<String> {
        let mut deps: Vec<String> = Vec::new();
        let targets = self.spec.fields.iter().filter_map(FieldRule::target);
        for name in self.spec.depends_on.iter().map(String::as_str).chain(targets) {
            if name != self.spec.name && !deps.iter().any(|d| d == name) {
                deps.push(name.to_string());
            }
        }
        deps
    }

    fn transform(
        &self,
        record: &SourceRecord,
        ctx: &mut TransformContext<'_, '_>,
    ) -> Result<Vec<PendingOperation>, MigrateError> {
        let mut payload = self.build_payload(record, ctx)?;

        let natural_key = self.natural_key.domain_for(&payload).ok_or_else(|| {
            self.not_found(
                record,
                format!(
                    "natural key field(s) without value: {}",
                    self.natural_key.missing_fields(&payload).join(", ")
                ),
            )
        })?;

        let action = if ctx.exists_in_destination(&self.spec.name, &natural_key)? {
            payload = self.update_payload(payload);
            Action::Update
        } else {
            if let Some(field) = &self.legacy_id_field {
                payload.insert(field.clone(), Value::from(record.id));
            }
            Action::Create
        };

        Ok(vec![PendingOperation {
            action,
            entity_type: self.spec.name.clone(),
            source_id: record.id,
            payload,
            natural_key,
            back_reference: ctx.back_reference(record),
        }])
    }
}
