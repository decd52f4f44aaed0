//! Batched migration driver.
//!
//! For each entity type, in dependency order:
//!
//! 1. Fetch a page at `offset`, ordered by id. An empty page ends the entity
//!    type; a short page does not.
//! 2. Transform every record of the page.
//! 3. Reconcile the page's operations as one batch.
//! 4. Advance `offset` by the page size.
//!
//! Failures stay as local as possible: a record that cannot be resolved is
//! skipped, an entity type whose store fails is abandoned, and the run goes
//! on with the next entity type. The entity type's mapping table is flushed
//! whichever way it ended.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};

use crate::config::SeedConfig;
use crate::error::{ConfigError, ErrorCode};
use crate::handler::{HandlerRegistry, TransformContext};
use crate::mapping::MappingStore;
use crate::model::{Domain, PendingOperation};
use crate::plan::migration_order;
use crate::reconcile::Reconciler;
use crate::store::{DEFAULT_ORDER, RecordStore};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    pub page_size: usize,
    pub order_by: String,
    pub back_reference_field: String,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            page_size: 100,
            order_by: DEFAULT_ORDER.to_string(),
            back_reference_field: "new_id".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    /// The source was read to the empty page.
    Completed,
    /// A store failed part way; later pages were not read.
    Aborted,
    /// Nothing was read (no handler).
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityReport {
    pub entity_type: String,
    pub status: EntityStatus,
    /// Page reads, including the final empty one.
    pub fetches: usize,
    pub records: usize,
    pub created: usize,
    pub updated: usize,
    /// Records skipped by transform or reconcile.
    pub skipped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
}

impl EntityReport {
    fn new(entity_type: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            status: EntityStatus::Completed,
            fetches: 0,
            records: 0,
            created: 0,
            updated: 0,
            skipped: 0,
            error: None,
            error_code: None,
        }
    }

    fn fail(&mut self, status: EntityStatus, code: ErrorCode, message: String) {
        self.status = status;
        self.error_code = Some(code.code());
        self.error = Some(message);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    pub entity_type: String,
    pub key_field: String,
    pub seeded: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub seeds: Vec<SeedReport>,
    pub entities: Vec<EntityReport>,
}

impl RunReport {
    #[must_use]
    pub fn created(&self) -> usize {
        self.entities.iter().map(|e| e.created).sum()
    }

    #[must_use]
    pub fn updated(&self) -> usize {
        self.entities.iter().map(|e| e.updated).sum()
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        self.entities.iter().map(|e| e.skipped).sum()
    }

    /// True when every entity type completed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.entities
            .iter()
            .all(|e| e.status == EntityStatus::Completed)
    }

    #[must_use]
    pub fn entity(&self, entity_type: &str) -> Option<&EntityReport> {
        self.entities.iter().find(|e| e.entity_type == entity_type)
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct Pipeline<'a> {
    source: &'a dyn RecordStore,
    destination: &'a dyn RecordStore,
    registry: &'a HandlerRegistry,
    mappings: &'a mut MappingStore,
    options: PipelineOptions,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        source: &'a dyn RecordStore,
        destination: &'a dyn RecordStore,
        registry: &'a HandlerRegistry,
        mappings: &'a mut MappingStore,
        options: PipelineOptions,
    ) -> Self {
        Self {
            source,
            destination,
            registry,
            mappings,
            options,
        }
    }

    #[must_use]
    pub const fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Seed mapping tables by natural-key matching. Failures are logged and
    /// reported; the remaining seeds still run.
    pub fn seed(&mut self, seeds: &[SeedConfig]) -> Vec<SeedReport> {
        let mut reports = Vec::with_capacity(seeds.len());
        for seed in seeds {
            let _span = info_span!("seed", entity_type = %seed.entity_type).entered();
            let result = self.mappings.bulk_populate_from_remote(
                self.source,
                self.destination,
                &seed.entity_type,
                &seed.key_field,
                self.options.page_size,
            );
            let mut report = SeedReport {
                entity_type: seed.entity_type.clone(),
                key_field: seed.key_field.clone(),
                seeded: 0,
                error: None,
            };
            match result {
                Ok(seeded) => report.seeded = seeded,
                Err(e) => {
                    error!(entity_type = %seed.entity_type, code = %e.code(), error = %e, "seed failed");
                    report.error = Some(e.to_string());
                }
            }
            self.checkpoint(&seed.entity_type);
            reports.push(report);
        }
        reports
    }

    /// Migrate `requested` entity types in dependency order.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] before touching any record if the requested
    /// entity types depend on each other in a cycle.
    pub fn run(&mut self, requested: &[String]) -> Result<RunReport, ConfigError> {
        self.run_with_seeds(requested, &[])
    }

    /// Seed, then migrate.
    ///
    /// # Errors
    ///
    /// See [`Pipeline::run`].
    pub fn run_with_seeds(
        &mut self,
        requested: &[String],
        seeds: &[SeedConfig],
    ) -> Result<RunReport, ConfigError> {
        let order = migration_order(requested, self.registry)?;
        let started_at = Utc::now();
        info!(entity_types = order.len(), page_size = self.options.page_size, "migration started");

        let seeds = self.seed(seeds);
        let mut entities = Vec::with_capacity(order.len());
        for entity_type in &order {
            entities.push(self.migrate_entity(entity_type));
        }

        let report = RunReport {
            started_at,
            finished_at: Utc::now(),
            seeds,
            entities,
        };
        info!(
            created = report.created(),
            updated = report.updated(),
            skipped = report.skipped(),
            clean = report.is_clean(),
            "migration finished"
        );
        Ok(report)
    }

    /// Migrate one entity type to its empty page, then flush its table.
    pub fn migrate_entity(&mut self, entity_type: &str) -> EntityReport {
        let _span = info_span!("migrate", entity_type).entered();
        let mut report = EntityReport::new(entity_type);

        match self.registry.build(entity_type) {
            Ok(handler) => {
                let source = self.source;
                let destination = self.destination;
                let page_size = self.options.page_size.max(1);
                let reconciler =
                    Reconciler::new(source, destination, &self.options.back_reference_field);
                let mappings = &mut *self.mappings;
                let filter = Domain::new();
                let mut offset = 0;

                'pages: loop {
                    let page = match source.fetch_page(
                        entity_type,
                        &filter,
                        offset,
                        page_size,
                        &self.options.order_by,
                    ) {
                        Ok(page) => page,
                        Err(e) => {
                            error!(entity_type, offset, code = %e.code(), error = %e, "page fetch failed, entity type abandoned");
                            report.fail(EntityStatus::Aborted, e.code(), e.to_string());
                            break;
                        }
                    };
                    report.fetches += 1;
                    if page.is_empty() {
                        break;
                    }
                    debug!(entity_type, offset, records = page.len(), "page fetched");

                    let mut ops: Vec<PendingOperation> = Vec::with_capacity(page.len());
                    for record in &page {
                        report.records += 1;
                        let mut ctx = TransformContext::new(&reconciler, mappings);
                        match handler.transform(record, &mut ctx) {
                            Ok(planned) => ops.extend(planned),
                            Err(e) if e.is_record_scoped() => {
                                warn!(entity_type, source_id = %record.id, code = %e.code(), error = %e, "record skipped");
                                report.skipped += 1;
                            }
                            Err(e) => {
                                error!(entity_type, source_id = %record.id, code = %e.code(), error = %e, "transform failed, entity type abandoned");
                                report.fail(EntityStatus::Aborted, e.code(), e.to_string());
                                break 'pages;
                            }
                        }
                    }

                    match reconciler.reconcile_and_apply(ops, mappings) {
                        Ok(outcome) => {
                            report.created += outcome.created;
                            report.updated += outcome.updated;
                            report.skipped += outcome.failures.len();
                        }
                        Err(aborted) => {
                            report.created += aborted.outcome.created;
                            report.updated += aborted.outcome.updated;
                            report.skipped += aborted.outcome.failures.len();
                            error!(entity_type, offset, code = %aborted.error.code(), error = %aborted, "batch aborted, entity type abandoned");
                            report.fail(
                                EntityStatus::Aborted,
                                aborted.error.code(),
                                aborted.error.to_string(),
                            );
                            break;
                        }
                    }

                    offset += page_size;
                }
            }
            Err(e) => {
                warn!(entity_type, code = %e.code(), error = %e, "entity type skipped");
                report.fail(EntityStatus::Skipped, e.code(), e.to_string());
            }
        }

        self.checkpoint(entity_type);
        info!(
            entity_type,
            status = ?report.status,
            records = report.records,
            created = report.created,
            updated = report.updated,
            skipped = report.skipped,
            "entity type finished"
        );
        report
    }

    /// Flush one table; a failure only degrades persistence.
    fn checkpoint(&mut self, entity_type: &str) {
        if let Err(e) = self.mappings.flush(entity_type) {
            warn!(entity_type, code = %e.code(), error = %e, "mapping flush failed, continuing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{EntitySpec, HandlerSettings};
    use crate::model::Fields;
    use crate::store::MemoryRecordStore;
    use serde_json::json;
    use tempfile::TempDir;

    fn login(value: &str) -> Fields {
        let mut fields = Fields::new();
        fields.insert("login".into(), json!(value));
        fields
    }

    fn users_registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new(HandlerSettings::default());
        registry.register_spec(EntitySpec::new("res.users", ["login"]).copy_fields(&["login"]));
        registry
    }

    #[test]
    fn unregistered_entity_type_is_skipped_and_run_continues() {
        let dir = TempDir::new().expect("tempdir");
        let mut mappings = MappingStore::open(dir.path()).expect("mappings");
        let source = MemoryRecordStore::new("source");
        let destination = MemoryRecordStore::new("destination");
        source.insert("res.users", login("a"));
        let registry = users_registry();

        let mut pipeline = Pipeline::new(
            &source,
            &destination,
            &registry,
            &mut mappings,
            PipelineOptions::default(),
        );
        let report = pipeline
            .run(&["x.unknown".to_string(), "res.users".to_string()])
            .expect("run");

        let skipped = report.entity("x.unknown").expect("reported");
        assert_eq!(skipped.status, EntityStatus::Skipped);
        assert_eq!(skipped.error_code, Some("F2001"));
        assert_eq!(skipped.fetches, 0);
        assert_eq!(report.entity("res.users").expect("users").created, 1);
        assert!(!report.is_clean());
    }

    #[test]
    fn report_serializes_to_json() {
        let dir = TempDir::new().expect("tempdir");
        let mut mappings = MappingStore::open(dir.path()).expect("mappings");
        let source = MemoryRecordStore::new("source");
        let destination = MemoryRecordStore::new("destination");
        let registry = users_registry();

        let mut pipeline = Pipeline::new(
            &source,
            &destination,
            &registry,
            &mut mappings,
            PipelineOptions::default(),
        );
        let report = pipeline.run(&["res.users".to_string()]).expect("run");
        let value = serde_json::to_value(&report).expect("serialize");
        assert_eq!(value["entities"][0]["status"], json!("completed"));
        assert_eq!(value["entities"][0]["fetches"], json!(1));
        assert!(value["entities"][0].get("error").is_none());
    }
}
