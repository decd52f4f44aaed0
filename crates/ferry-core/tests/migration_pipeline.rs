//! End-to-end pipeline runs against in-memory record stores.
//!
//! Covers:
//! - idempotent re-runs (the two-user login example)
//! - pagination call counts and short pages in the middle of a collection
//! - create-vs-update decisions against pre-existing destination records
//! - record-level and entity-level failure isolation
//! - stale back-references pointing at deleted destination records
//! - recovery from a lost mapping directory

use std::path::Path;

use ferry_core::config::SeedConfig;
use ferry_core::handler::{EntitySpec, FieldRule, HandlerRegistry, HandlerSettings};
use ferry_core::mapping::MappingStore;
use ferry_core::model::{Fields, RecordId};
use ferry_core::pipeline::{EntityStatus, Pipeline, PipelineOptions, RunReport};
use ferry_core::store::{MemoryRecordStore, RecordStore};
use serde_json::{Value, json};
use tempfile::TempDir;

fn fields(pairs: &[(&str, Value)]) -> Fields {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_string()).collect()
}

fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new(HandlerSettings::default());
    registry.register_spec(EntitySpec::new("res.users", ["login"]).copy_fields(&["login", "name"]));
    registry.register_spec(EntitySpec::new("res.partner", ["name"]).copy_fields(&["name"]));
    registry.register_spec(EntitySpec::new("product.attribute", ["name"]).copy_fields(&["name"]));
    registry.register_spec(
        EntitySpec::new("product.attribute.value", ["name", "attribute_id"])
            .copy_fields(&["name"])
            .field(FieldRule::reference("attribute_id", "product.attribute")),
    );
    registry
}

fn options(page_size: usize) -> PipelineOptions {
    PipelineOptions {
        page_size,
        ..PipelineOptions::default()
    }
}

fn run(
    mappings_dir: &Path,
    source: &MemoryRecordStore,
    destination: &MemoryRecordStore,
    requested: &[&str],
    page_size: usize,
) -> RunReport {
    let registry = registry();
    let mut mappings = MappingStore::open(mappings_dir).expect("open mappings");
    let mut pipeline = Pipeline::new(
        source,
        destination,
        &registry,
        &mut mappings,
        options(page_size),
    );
    pipeline.run(&names(requested)).expect("run")
}

fn mapping(mappings_dir: &Path, entity_type: &str, source_id: RecordId) -> Option<RecordId> {
    let mut mappings = MappingStore::open(mappings_dir).expect("open mappings");
    mappings.get(entity_type, source_id)
}

// ---------------------------------------------------------------------------
// Idempotence
// ---------------------------------------------------------------------------

#[test]
fn second_run_updates_instead_of_creating() {
    let dir = TempDir::new().expect("tempdir");
    let maps = dir.path().join("mappings");
    let source = MemoryRecordStore::new("source");
    let destination = MemoryRecordStore::new("destination");
    let a = source.insert("res.users", fields(&[("login", json!("a@x.com"))]));
    let b = source.insert("res.users", fields(&[("login", json!("b@x.com"))]));

    let first = run(&maps, &source, &destination, &["res.users"], 100);
    let users = first.entity("res.users").expect("users report");
    assert_eq!((users.created, users.updated), (2, 0));
    assert_eq!(destination.count("res.users"), 2);

    // Both correlations are stored twice: mapping table and back-reference.
    for src in [a, b] {
        let dest = mapping(&maps, "res.users", src).expect("mapped");
        let record = source.get("res.users", src).expect("source record");
        assert_eq!(record.get("new_id"), Some(&json!(dest.get())));
    }

    let second = run(&maps, &source, &destination, &["res.users"], 100);
    let users = second.entity("res.users").expect("users report");
    assert_eq!((users.created, users.updated), (0, 2));
    assert_eq!(destination.count("res.users"), 2);
}

#[test]
fn lost_mapping_directory_does_not_duplicate_records() {
    let dir = TempDir::new().expect("tempdir");
    let source = MemoryRecordStore::new("source");
    let destination = MemoryRecordStore::new("destination");
    let mut ids = Vec::new();
    for n in 0..5 {
        ids.push(source.insert("res.partner", fields(&[("name", json!(format!("P{n}")))])));
    }

    run(&dir.path().join("first"), &source, &destination, &["res.partner"], 2);
    assert_eq!(destination.count("res.partner"), 5);

    // Cache and back-references both gone: only the natural key remains.
    for id in &ids {
        source
            .update("res.partner", *id, &fields(&[("new_id", json!(false))]))
            .expect("clear back-reference");
    }
    let report = run(&dir.path().join("second"), &source, &destination, &["res.partner"], 2);

    let partners = report.entity("res.partner").expect("report");
    assert_eq!((partners.created, partners.updated), (0, 5));
    assert_eq!(destination.count("res.partner"), 5);
    assert!(mapping(&dir.path().join("second"), "res.partner", ids[0]).is_some());
}

// ---------------------------------------------------------------------------
// Pagination
// ---------------------------------------------------------------------------

#[test]
fn fetch_count_is_pages_plus_one() {
    for (records, page_size) in [(7usize, 3usize), (6, 3), (1, 100), (0, 5)] {
        let dir = TempDir::new().expect("tempdir");
        let source = MemoryRecordStore::new("source");
        let destination = MemoryRecordStore::new("destination");
        for n in 0..records {
            source.insert("res.users", fields(&[("login", json!(format!("u{n}")))]));
        }

        let report = run(dir.path(), &source, &destination, &["res.users"], page_size);

        let expected = records.div_ceil(page_size) + 1;
        assert_eq!(source.calls().fetch, expected, "{records} records / {page_size}");
        let users = report.entity("res.users").expect("report");
        assert_eq!(users.fetches, expected);
        assert_eq!(users.records, records);
        assert_eq!(destination.count("res.users"), records);
    }
}

#[test]
fn short_page_mid_collection_does_not_stop_the_loop() {
    let dir = TempDir::new().expect("tempdir");
    let source = MemoryRecordStore::new("source");
    let destination = MemoryRecordStore::new("destination");
    let mut ids = Vec::new();
    for n in 0..10 {
        ids.push(source.insert("res.users", fields(&[("login", json!(format!("u{n}")))])));
    }
    source.hide("res.users", ids[1]);
    source.hide("res.users", ids[2]);

    let report = run(dir.path(), &source, &destination, &["res.users"], 4);

    let users = report.entity("res.users").expect("report");
    assert_eq!(users.status, EntityStatus::Completed);
    assert_eq!(users.fetches, 4);
    assert_eq!(users.records, 8);
    assert_eq!(destination.count("res.users"), 8);
}

// ---------------------------------------------------------------------------
// Create vs update
// ---------------------------------------------------------------------------

#[test]
fn existing_destination_record_is_updated_not_created() {
    let dir = TempDir::new().expect("tempdir");
    let source = MemoryRecordStore::new("source");
    let destination = MemoryRecordStore::new("destination");
    let src = source.insert(
        "res.users",
        fields(&[("login", json!("a@x.com")), ("name", json!("Alice"))]),
    );
    let existing = destination.insert(
        "res.users",
        fields(&[("login", json!("a@x.com")), ("name", json!("A."))]),
    );

    let report = run(dir.path(), &source, &destination, &["res.users"], 10);

    let users = report.entity("res.users").expect("report");
    assert_eq!((users.created, users.updated), (0, 1));
    assert_eq!(destination.calls().create, 0);
    let stored = destination.get("res.users", existing).expect("dest record");
    assert_eq!(stored.get("name"), Some(&json!("Alice")));
    assert_eq!(mapping(dir.path(), "res.users", src), Some(existing));
}

// ---------------------------------------------------------------------------
// Failure isolation
// ---------------------------------------------------------------------------

#[test]
fn unresolvable_reference_skips_only_that_record() {
    let dir = TempDir::new().expect("tempdir");
    let source = MemoryRecordStore::new("source");
    let destination = MemoryRecordStore::new("destination");
    let color = source.insert("product.attribute", fields(&[("name", json!("Color"))]));
    let orphan_attribute = RecordId::new(999).expect("id");
    source.insert(
        "product.attribute.value",
        fields(&[("name", json!("Red")), ("attribute_id", json!([color.get(), "Color"]))]),
    );
    source.insert(
        "product.attribute.value",
        fields(&[("name", json!("Ghost")), ("attribute_id", json!(orphan_attribute.get()))]),
    );
    source.insert(
        "product.attribute.value",
        fields(&[("name", json!("Blue")), ("attribute_id", json!([color.get(), "Color"]))]),
    );

    // Requested out of order: the reference moves product.attribute first.
    let report = run(
        dir.path(),
        &source,
        &destination,
        &["product.attribute.value", "product.attribute"],
        10,
    );

    assert_eq!(report.entities[0].entity_type, "product.attribute");
    let values = report.entity("product.attribute.value").expect("report");
    assert_eq!(values.status, EntityStatus::Completed);
    assert_eq!((values.created, values.skipped), (2, 1));

    let dest_color = mapping(dir.path(), "product.attribute", color).expect("color mapped");
    for value in destination.records("product.attribute.value") {
        assert_eq!(value.fields.get("attribute_id"), Some(&json!(dest_color.get())));
    }
}

#[test]
fn transport_failure_abandons_only_its_entity_type() {
    let dir = TempDir::new().expect("tempdir");
    let source = MemoryRecordStore::new("source");
    let destination = MemoryRecordStore::new("destination");
    source.insert("res.partner", fields(&[("name", json!("Acme"))]));
    source.insert("res.users", fields(&[("login", json!("a@x.com"))]));
    destination.set_unreachable("res.partner", true);

    let report = run(dir.path(), &source, &destination, &["res.partner", "res.users"], 10);

    let partners = report.entity("res.partner").expect("partner report");
    assert_eq!(partners.status, EntityStatus::Aborted);
    assert_eq!(partners.error_code, Some("F3001"));
    let users = report.entity("res.users").expect("users report");
    assert_eq!(users.status, EntityStatus::Completed);
    assert_eq!(users.created, 1);
    assert!(!report.is_clean());
}

#[test]
fn stale_back_reference_is_repaired_not_fatal() {
    let dir = TempDir::new().expect("tempdir");
    let source = MemoryRecordStore::new("source");
    let destination = MemoryRecordStore::new("destination");
    // A back-reference left over from a destination that was since reset.
    let a = source.insert(
        "res.users",
        fields(&[("login", json!("a")), ("new_id", json!(999))]),
    );
    let b = source.insert("res.users", fields(&[("login", json!("b"))]));
    let existing = destination.insert("res.users", fields(&[("login", json!("a"))]));

    let report = run(dir.path(), &source, &destination, &["res.users"], 10);

    let users = report.entity("res.users").expect("users report");
    assert_eq!(users.status, EntityStatus::Completed);
    assert_eq!((users.created, users.updated, users.skipped), (1, 1, 0));
    assert_eq!(destination.count("res.users"), 2);
    assert_eq!(mapping(dir.path(), "res.users", a), Some(existing));
    assert!(mapping(dir.path(), "res.users", b).is_some());
    let repaired = source.get("res.users", a).expect("source record");
    assert_eq!(repaired.get("new_id"), Some(&json!(existing.get())));
    assert!(report.is_clean());
}

#[test]
fn source_outage_keeps_earlier_correlations() {
    let dir = TempDir::new().expect("tempdir");
    let source = MemoryRecordStore::new("source");
    let destination = MemoryRecordStore::new("destination");
    let first = source.insert("res.users", fields(&[("login", json!("a"))]));
    source.insert("res.partner", fields(&[("name", json!("Acme"))]));
    source.set_unreachable("res.partner", true);

    let report = run(dir.path(), &source, &destination, &["res.users", "res.partner"], 10);

    let partners = report.entity("res.partner").expect("partner report");
    assert_eq!(partners.status, EntityStatus::Aborted);
    assert_eq!(partners.fetches, 0);
    assert_eq!(report.entity("res.users").expect("users").created, 1);
    assert!(mapping(dir.path(), "res.users", first).is_some());
}

#[test]
fn unregistered_entity_type_is_skipped() {
    let dir = TempDir::new().expect("tempdir");
    let source = MemoryRecordStore::new("source");
    let destination = MemoryRecordStore::new("destination");
    source.insert("res.groups", fields(&[("name", json!("Sales"))]));

    let report = run(dir.path(), &source, &destination, &["res.groups", "res.users"], 10);

    let groups = report.entity("res.groups").expect("groups report");
    assert_eq!(groups.status, EntityStatus::Skipped);
    assert_eq!(groups.error_code, Some("F2001"));
    assert_eq!(source.calls().fetch, 1);
}

// ---------------------------------------------------------------------------
// Seeding
// ---------------------------------------------------------------------------

#[test]
fn seeded_table_lets_references_resolve_without_migrating_the_target() {
    let dir = TempDir::new().expect("tempdir");
    let source = MemoryRecordStore::new("source");
    let destination = MemoryRecordStore::new("destination");
    let src_color = source.insert("product.attribute", fields(&[("name", json!("Color"))]));
    let dest_color = destination.insert("product.attribute", fields(&[("name", json!("Color"))]));
    source.insert(
        "product.attribute.value",
        fields(&[("name", json!("Red")), ("attribute_id", json!(src_color.get()))]),
    );

    let registry = registry();
    let mut mappings = MappingStore::open(dir.path()).expect("mappings");
    let mut pipeline = Pipeline::new(&source, &destination, &registry, &mut mappings, options(10));
    let report = pipeline
        .run_with_seeds(
            &names(&["product.attribute.value"]),
            &[SeedConfig {
                entity_type: "product.attribute".into(),
                key_field: "name".into(),
            }],
        )
        .expect("run");

    assert_eq!(report.seeds[0].seeded, 1);
    assert_eq!(report.entity("product.attribute.value").expect("values").created, 1);
    let red = &destination.records("product.attribute.value")[0];
    assert_eq!(red.fields.get("attribute_id"), Some(&json!(dest_color.get())));
}
