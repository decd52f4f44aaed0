//! The create-or-update decision shared by every entity type.
//!
//! Existence is always decided by a destination-side natural-key search,
//! never by the mapping cache: a record created by an interrupted run whose
//! mapping was never flushed is still found and updated instead of being
//! created twice.
//!
//! Every successful write produces a correlation that is stored twice: in the
//! [`MappingStore`] and in the source record's back-reference field.

use std::fmt;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{MigrateError, TransportError};
use crate::mapping::MappingStore;
use crate::model::{Action, Correlation, Domain, Payload, PendingOperation, RecordId};
use crate::store::RecordStore;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// A record that was skipped while the rest of its batch went ahead.
#[derive(Debug)]
pub struct RecordFailure {
    pub source_id: RecordId,
    pub error: MigrateError,
}

/// Result of applying one batch of operations.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub created: usize,
    pub updated: usize,
    pub failures: Vec<RecordFailure>,
}

impl BatchOutcome {
    #[must_use]
    pub const fn writes(&self) -> usize {
        self.created + self.updated
    }
}

/// A transport failure stopped the batch. Writes applied before the failure
/// are reported in `outcome`.
#[derive(Debug)]
pub struct BatchAborted {
    pub outcome: BatchOutcome,
    pub error: TransportError,
}

impl fmt::Display for BatchAborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batch aborted after {} write(s): {}",
            self.outcome.writes(),
            self.error
        )
    }
}

impl std::error::Error for BatchAborted {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// Applies [`PendingOperation`]s to the destination.
pub struct Reconciler<'a> {
    source: &'a dyn RecordStore,
    destination: &'a dyn RecordStore,
    back_reference_field: &'a str,
}

impl<'a> Reconciler<'a> {
    pub const fn new(
        source: &'a dyn RecordStore,
        destination: &'a dyn RecordStore,
        back_reference_field: &'a str,
    ) -> Self {
        Self {
            source,
            destination,
            back_reference_field,
        }
    }

    #[must_use]
    pub const fn back_reference_field(&self) -> &str {
        self.back_reference_field
    }

    /// Whether the destination holds a record matching `key`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the destination cannot be queried.
    pub fn exists_in_destination(
        &self,
        entity_type: &str,
        key: &Domain,
    ) -> Result<bool, TransportError> {
        Ok(self.find_in_destination(entity_type, key)?.is_some())
    }

    fn find_in_destination(
        &self,
        entity_type: &str,
        key: &Domain,
    ) -> Result<Option<RecordId>, TransportError> {
        if key.is_empty() {
            return Ok(None);
        }
        Ok(self
            .destination
            .search(entity_type, key, 1)?
            .into_iter()
            .next())
    }

    /// Apply a batch in order.
    ///
    /// Record-level failures are collected in [`BatchOutcome::failures`] and
    /// the batch continues. A fault the remote side raises for one record
    /// counts as a record-level failure.
    ///
    /// # Errors
    ///
    /// Returns [`BatchAborted`] as soon as either endpoint stops answering.
    pub fn reconcile_and_apply(
        &self,
        ops: Vec<PendingOperation>,
        mappings: &mut MappingStore,
    ) -> Result<BatchOutcome, BatchAborted> {
        let mut outcome = BatchOutcome::default();

        for op in ops {
            let source_id = op.source_id;
            let result = match op.action {
                Action::Create => self.apply_create(&op, mappings),
                Action::Update => self.apply_update(&op, mappings),
            };
            match result {
                Ok(Action::Create) => outcome.created += 1,
                Ok(Action::Update) => outcome.updated += 1,
                Err(MigrateError::Transport(error)) if error.is_connection_failure() => {
                    return Err(BatchAborted { outcome, error });
                }
                Err(error) => {
                    warn!(
                        entity_type = %op.entity_type,
                        %source_id,
                        code = %error.code(),
                        error = %error,
                        "record skipped"
                    );
                    outcome.failures.push(RecordFailure { source_id, error });
                }
            }
        }

        Ok(outcome)
    }

    /// Returns the action actually applied.
    fn apply_create(
        &self,
        op: &PendingOperation,
        mappings: &mut MappingStore,
    ) -> Result<Action, MigrateError> {
        let entity_type = op.entity_type.as_str();

        if let Some(dest_id) = self.find_in_destination(entity_type, &op.natural_key)? {
            debug!(
                entity_type,
                source_id = %op.source_id,
                %dest_id,
                key = %op.natural_key,
                "record appeared in destination, updating instead of creating"
            );
            self.destination.update(entity_type, dest_id, &op.payload)?;
            self.correlate(op, dest_id, mappings)?;
            return Ok(Action::Update);
        }

        let dest_id = self.destination.create(entity_type, &op.payload)?;
        info!(entity_type, source_id = %op.source_id, %dest_id, "record created");
        self.correlate(op, dest_id, mappings)?;
        Ok(Action::Create)
    }

    /// Try the stored destination ids first, back-reference before mapping.
    /// An id the destination rejects is skipped and the natural key decides.
    fn apply_update(
        &self,
        op: &PendingOperation,
        mappings: &mut MappingStore,
    ) -> Result<Action, MigrateError> {
        let entity_type = op.entity_type.as_str();
        let mut rejected: Vec<RecordId> = Vec::new();

        let known = [op.back_reference, mappings.get(entity_type, op.source_id)];
        for dest_id in known.into_iter().flatten() {
            if rejected.contains(&dest_id) {
                continue;
            }
            match self.destination.update(entity_type, dest_id, &op.payload) {
                Ok(()) => {
                    debug!(entity_type, source_id = %op.source_id, %dest_id, "record updated");
                    self.correlate(op, dest_id, mappings)?;
                    return Ok(Action::Update);
                }
                Err(error) if error.is_connection_failure() => return Err(error.into()),
                Err(error) => {
                    warn!(
                        entity_type,
                        source_id = %op.source_id,
                        %dest_id,
                        error = %error,
                        "stored destination id rejected, falling back"
                    );
                    rejected.push(dest_id);
                }
            }
        }

        match self.find_in_destination(entity_type, &op.natural_key)? {
            Some(dest_id) if !rejected.contains(&dest_id) => {
                self.destination.update(entity_type, dest_id, &op.payload)?;
                debug!(
                    entity_type,
                    source_id = %op.source_id,
                    %dest_id,
                    key = %op.natural_key,
                    "record updated by natural key"
                );
                self.correlate(op, dest_id, mappings)?;
                Ok(Action::Update)
            }
            _ => Err(MigrateError::not_found(
                entity_type,
                op.source_id,
                format!("no destination record matches {}", op.natural_key),
            )),
        }
    }

    /// Store the correlation in the mapping table and, when it changed, on
    /// the source record.
    fn correlate(
        &self,
        op: &PendingOperation,
        dest_id: RecordId,
        mappings: &mut MappingStore,
    ) -> Result<(), TransportError> {
        let correlation = Correlation {
            entity_type: &op.entity_type,
            source_id: op.source_id,
            dest_id,
        };
        mappings.set(correlation.entity_type, correlation.source_id, correlation.dest_id);

        if op.back_reference != Some(dest_id) {
            let mut back_reference = Payload::new();
            back_reference.insert(
                self.back_reference_field.to_string(),
                Value::from(correlation.dest_id),
            );
            self.source
                .update(correlation.entity_type, correlation.source_id, &back_reference)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Fields;
    use crate::store::MemoryRecordStore;
    use serde_json::json;
    use tempfile::TempDir;

    fn fields(pairs: &[(&str, Value)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn op(action: Action, source_id: RecordId, login: &str) -> PendingOperation {
        PendingOperation {
            action,
            entity_type: "res.users".into(),
            source_id,
            payload: fields(&[("login", json!(login))]),
            natural_key: Domain::eq("login", login),
            back_reference: None,
        }
    }

    struct Fixture {
        _dir: TempDir,
        mappings: MappingStore,
        source: MemoryRecordStore,
        destination: MemoryRecordStore,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().expect("tempdir");
        let mappings = MappingStore::open(dir.path().join("maps")).expect("mapping store");
        Fixture {
            _dir: dir,
            mappings,
            source: MemoryRecordStore::new("source"),
            destination: MemoryRecordStore::new("destination"),
        }
    }

    #[test]
    fn create_writes_record_mapping_and_back_reference() {
        let mut fx = fixture();
        let src = fx.source.insert("res.users", fields(&[("login", json!("a"))]));
        let reconciler = Reconciler::new(&fx.source, &fx.destination, "new_id");

        let outcome = reconciler
            .reconcile_and_apply(vec![op(Action::Create, src, "a")], &mut fx.mappings)
            .expect("apply");

        assert_eq!(outcome.created, 1);
        let dest = fx.mappings.get("res.users", src).expect("mapped");
        let stored = fx.source.get("res.users", src).expect("source record");
        assert_eq!(stored.get("new_id"), Some(&json!(dest.get())));
    }

    #[test]
    fn create_becomes_update_when_key_matches() {
        let mut fx = fixture();
        let src = fx.source.insert("res.users", fields(&[("login", json!("a"))]));
        let existing = fx
            .destination
            .insert("res.users", fields(&[("login", json!("a"))]));
        let reconciler = Reconciler::new(&fx.source, &fx.destination, "new_id");

        let outcome = reconciler
            .reconcile_and_apply(vec![op(Action::Create, src, "a")], &mut fx.mappings)
            .expect("apply");

        assert_eq!((outcome.created, outcome.updated), (0, 1));
        assert_eq!(fx.destination.count("res.users"), 1);
        assert_eq!(fx.destination.calls().create, 0);
        assert_eq!(fx.mappings.get("res.users", src), Some(existing));
    }

    #[test]
    fn update_prefers_back_reference_over_mapping() {
        let mut fx = fixture();
        let src = fx.source.insert("res.users", fields(&[("login", json!("a"))]));
        let stale = fx.destination.insert("res.users", fields(&[("login", json!("old"))]));
        let current = fx.destination.insert("res.users", fields(&[("login", json!("a"))]));
        fx.mappings.set("res.users", src, stale);

        let mut update = op(Action::Update, src, "a");
        update.back_reference = Some(current);
        let reconciler = Reconciler::new(&fx.source, &fx.destination, "new_id");
        reconciler
            .reconcile_and_apply(vec![update], &mut fx.mappings)
            .expect("apply");

        assert_eq!(fx.mappings.get("res.users", src), Some(current));
        // Back-reference already correct: no write to the source.
        assert_eq!(fx.source.calls().update, 0);
    }

    #[test]
    fn update_falls_back_to_natural_key_search() {
        let mut fx = fixture();
        let src = fx.source.insert("res.users", fields(&[("login", json!("a"))]));
        let dest = fx.destination.insert("res.users", fields(&[("login", json!("a"))]));
        let reconciler = Reconciler::new(&fx.source, &fx.destination, "new_id");

        let outcome = reconciler
            .reconcile_and_apply(vec![op(Action::Update, src, "a")], &mut fx.mappings)
            .expect("apply");
        assert_eq!(outcome.updated, 1);
        assert_eq!(fx.mappings.get("res.users", src), Some(dest));
    }

    #[test]
    fn unresolvable_update_fails_only_that_record() {
        let mut fx = fixture();
        let missing = fx.source.insert("res.users", fields(&[("login", json!("ghost"))]));
        let present = fx.source.insert("res.users", fields(&[("login", json!("b"))]));
        let reconciler = Reconciler::new(&fx.source, &fx.destination, "new_id");

        let outcome = reconciler
            .reconcile_and_apply(
                vec![
                    op(Action::Update, missing, "ghost"),
                    op(Action::Create, present, "b"),
                ],
                &mut fx.mappings,
            )
            .expect("apply");

        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].source_id, missing);
        assert!(outcome.failures[0].error.is_record_scoped());
    }

    #[test]
    fn stale_back_reference_falls_back_to_natural_key() {
        let mut fx = fixture();
        let src = fx.source.insert("res.users", fields(&[("login", json!("a"))]));
        let dest = fx.destination.insert("res.users", fields(&[("login", json!("a"))]));
        let gone = RecordId::new(999).expect("positive id");

        let mut update = op(Action::Update, src, "a");
        update.back_reference = Some(gone);
        let reconciler = Reconciler::new(&fx.source, &fx.destination, "new_id");
        let outcome = reconciler
            .reconcile_and_apply(vec![update], &mut fx.mappings)
            .expect("stale id must not abort");

        assert_eq!(outcome.updated, 1);
        assert!(outcome.failures.is_empty());
        assert_eq!(fx.mappings.get("res.users", src), Some(dest));
        let stored = fx.source.get("res.users", src).expect("source record");
        assert_eq!(stored.get("new_id"), Some(&json!(dest.get())));
    }

    #[test]
    fn stale_mapping_entry_falls_back_to_natural_key() {
        let mut fx = fixture();
        let src = fx.source.insert("res.users", fields(&[("login", json!("a"))]));
        let dest = fx.destination.insert("res.users", fields(&[("login", json!("a"))]));
        fx.mappings
            .set("res.users", src, RecordId::new(404).expect("positive id"));

        let reconciler = Reconciler::new(&fx.source, &fx.destination, "new_id");
        let outcome = reconciler
            .reconcile_and_apply(vec![op(Action::Update, src, "a")], &mut fx.mappings)
            .expect("apply");

        assert_eq!(outcome.updated, 1);
        assert_eq!(fx.mappings.get("res.users", src), Some(dest));
    }

    #[test]
    fn stale_id_without_key_match_fails_only_that_record() {
        let mut fx = fixture();
        let stale = fx.source.insert("res.users", fields(&[("login", json!("ghost"))]));
        let fresh = fx.source.insert("res.users", fields(&[("login", json!("b"))]));

        let mut update = op(Action::Update, stale, "ghost");
        update.back_reference = Some(RecordId::new(999).expect("positive id"));
        let reconciler = Reconciler::new(&fx.source, &fx.destination, "new_id");
        let outcome = reconciler
            .reconcile_and_apply(
                vec![update, op(Action::Create, fresh, "b")],
                &mut fx.mappings,
            )
            .expect("per-record fault must not abort");

        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].source_id, stale);
        assert_eq!(outcome.failures[0].error.code().code(), "F2002");
        assert!(fx.mappings.get("res.users", stale).is_none());
    }

    #[test]
    fn transport_failure_aborts_the_batch() {
        let mut fx = fixture();
        let first = fx.source.insert("res.users", fields(&[("login", json!("a"))]));
        fx.destination.set_unreachable("res.users", true);
        let reconciler = Reconciler::new(&fx.source, &fx.destination, "new_id");

        let aborted = reconciler
            .reconcile_and_apply(
                vec![op(Action::Create, first, "a"), op(Action::Create, first, "b")],
                &mut fx.mappings,
            )
            .expect_err("destination unreachable");

        assert_eq!(aborted.outcome.writes(), 0);
        assert_eq!(fx.destination.calls().search, 1);
        assert!(aborted.to_string().starts_with("batch aborted after 0 write(s)"));
    }
}
