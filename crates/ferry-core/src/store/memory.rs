//! In-process [`RecordStore`] used by tests and rehearsal runs.
//!
//! Besides plain storage it can simulate the two behaviours of a real record
//! system that matter to the pipeline:
//!
//! - **Hidden records**: records that occupy an offset slot but are dropped
//!   from the page after windowing, the way server-side access rules shorten
//!   a page in the middle of a collection.
//! - **Unreachable entity types**: every call for the entity type fails with
//!   a [`TransportError::Connect`], like a server that stopped answering.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::TransportError;
use crate::model::{Domain, Fields, Payload, RecordId, SourceRecord};
use crate::store::RecordStore;

/// Number of calls served, per method.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub fetch: usize,
    pub search: usize,
    pub create: usize,
    pub update: usize,
}

#[derive(Debug)]
pub struct MemoryRecordStore {
    label: String,
    tables: RefCell<BTreeMap<String, BTreeMap<RecordId, Fields>>>,
    next_id: Cell<i64>,
    hidden: RefCell<BTreeSet<(String, RecordId)>>,
    unreachable: RefCell<BTreeSet<String>>,
    calls: Cell<CallCounts>,
}

impl MemoryRecordStore {
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            tables: RefCell::new(BTreeMap::new()),
            next_id: Cell::new(1),
            hidden: RefCell::new(BTreeSet::new()),
            unreachable: RefCell::new(BTreeSet::new()),
            calls: Cell::new(CallCounts::default()),
        }
    }

    /// Insert a record under the next free id.
    pub fn insert(&self, entity_type: &str, fields: Fields) -> RecordId {
        let id = self.allocate_id();
        self.insert_with_id(entity_type, id, fields);
        id
    }

    /// Insert (or replace) a record under a chosen id.
    pub fn insert_with_id(&self, entity_type: &str, id: RecordId, fields: Fields) {
        if id.get() >= self.next_id.get() {
            self.next_id.set(id.get() + 1);
        }
        self.tables
            .borrow_mut()
            .entry(entity_type.to_string())
            .or_default()
            .insert(id, fields);
    }

    #[must_use]
    pub fn get(&self, entity_type: &str, id: RecordId) -> Option<Fields> {
        self.tables
            .borrow()
            .get(entity_type)
            .and_then(|table| table.get(&id).cloned())
    }

    #[must_use]
    pub fn count(&self, entity_type: &str) -> usize {
        self.tables.borrow().get(entity_type).map_or(0, BTreeMap::len)
    }

    /// All records of an entity type, ascending by id, hidden ones included.
    #[must_use]
    pub fn records(&self, entity_type: &str) -> Vec<SourceRecord> {
        self.tables
            .borrow()
            .get(entity_type)
            .map(|table| {
                table
                    .iter()
                    .map(|(id, fields)| SourceRecord::new(*id, fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Keep the record in its offset slot but leave it out of fetched pages.
    pub fn hide(&self, entity_type: &str, id: RecordId) {
        self.hidden
            .borrow_mut()
            .insert((entity_type.to_string(), id));
    }

    /// Make every call for `entity_type` fail (or succeed again).
    pub fn set_unreachable(&self, entity_type: &str, unreachable: bool) {
        let mut set = self.unreachable.borrow_mut();
        if unreachable {
            set.insert(entity_type.to_string());
        } else {
            set.remove(entity_type);
        }
    }

    #[must_use]
    pub fn calls(&self) -> CallCounts {
        self.calls.get()
    }

    pub fn reset_calls(&self) {
        self.calls.set(CallCounts::default());
    }

    fn allocate_id(&self) -> RecordId {
        let raw = self.next_id.get().max(1);
        self.next_id.set(raw + 1);
        RecordId::new(raw).unwrap_or_else(|| unreachable!("next_id starts at 1 and only grows"))
    }

    fn count_call(&self, bump: impl FnOnce(&mut CallCounts)) {
        let mut calls = self.calls.get();
        bump(&mut calls);
        self.calls.set(calls);
    }

    fn check_reachable(&self, entity_type: &str, method: &str) -> Result<(), TransportError> {
        if self.unreachable.borrow().contains(entity_type) {
            return Err(TransportError::Connect {
                endpoint: self.label.clone(),
                message: format!("{method} on {entity_type}: connection refused"),
            });
        }
        Ok(())
    }
}

impl RecordStore for MemoryRecordStore {
    fn label(&self) -> &str {
        &self.label
    }

    fn fetch_page(
        &self,
        entity_type: &str,
        filter: &Domain,
        offset: usize,
        limit: usize,
        order: &str,
    ) -> Result<Vec<SourceRecord>, TransportError> {
        self.count_call(|c| c.fetch += 1);
        self.check_reachable(entity_type, "fetch_page")?;

        let descending = match order.trim().to_ascii_lowercase().as_str() {
            "id" | "id asc" => false,
            "id desc" => true,
            other => {
                return Err(TransportError::Remote {
                    entity_type: entity_type.to_string(),
                    method: "fetch_page".to_string(),
                    message: format!("unsupported order '{other}'"),
                });
            }
        };

        let tables = self.tables.borrow();
        let Some(table) = tables.get(entity_type) else {
            return Ok(Vec::new());
        };

        let mut matching: Vec<(&RecordId, &Fields)> = table
            .iter()
            .filter(|(id, fields)| filter.matches(**id, fields))
            .collect();
        if descending {
            matching.reverse();
        }

        let hidden = self.hidden.borrow();
        Ok(matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .filter(|(id, _)| !hidden.contains(&(entity_type.to_string(), **id)))
            .map(|(id, fields)| SourceRecord::new(*id, fields.clone()))
            .collect())
    }

    fn search(
        &self,
        entity_type: &str,
        domain: &Domain,
        limit: usize,
    ) -> Result<Vec<RecordId>, TransportError> {
        self.count_call(|c| c.search += 1);
        self.check_reachable(entity_type, "search")?;

        let tables = self.tables.borrow();
        Ok(tables
            .get(entity_type)
            .map(|table| {
                table
                    .iter()
                    .filter(|(id, fields)| domain.matches(**id, fields))
                    .map(|(id, _)| *id)
                    .take(limit)
                    .collect()
            })
            .unwrap_or_default())
    }

    fn create(&self, entity_type: &str, payload: &Payload) -> Result<RecordId, TransportError> {
        self.count_call(|c| c.create += 1);
        self.check_reachable(entity_type, "create")?;
        Ok(self.insert(entity_type, payload.clone()))
    }

    fn update(
        &self,
        entity_type: &str,
        id: RecordId,
        payload: &Payload,
    ) -> Result<(), TransportError> {
        self.count_call(|c| c.update += 1);
        self.check_reachable(entity_type, "update")?;

        let mut tables = self.tables.borrow_mut();
        let record = tables
            .get_mut(entity_type)
            .and_then(|table| table.get_mut(&id))
            .ok_or_else(|| TransportError::Remote {
                entity_type: entity_type.to_string(),
                method: "update".to_string(),
                message: format!("record {id} does not exist"),
            })?;

        for (field, value) in payload {
            record.insert(field.clone(), value.clone());
        }
        Ok(())
    }
}
