//! Record system access.
//!
//! A [`RecordStore`] is one side of a migration (source or destination). The
//! pipeline only ever needs four calls: a paginated read, an equality search,
//! create and update. Every call may fail with a [`TransportError`].

pub mod memory;

use crate::error::TransportError;
use crate::model::{Domain, Payload, RecordId, SourceRecord};

pub use memory::MemoryRecordStore;

/// Sort order used for every paginated read. Offsets are only stable when the
/// order is total, so pages are always read by ascending id.
pub const DEFAULT_ORDER: &str = "id asc";

pub trait RecordStore {
    /// Label used in log lines ("source", "destination", a host name...).
    fn label(&self) -> &str;

    /// Read up to `limit` records matching `filter`, skipping `offset`
    /// records, sorted by `order`.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the record system cannot be reached or
    /// rejects the call.
    fn fetch_page(
        &self,
        entity_type: &str,
        filter: &Domain,
        offset: usize,
        limit: usize,
        order: &str,
    ) -> Result<Vec<SourceRecord>, TransportError>;

    /// Ids of at most `limit` records matching `domain`, ascending.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] on connectivity or remote failure.
    fn search(
        &self,
        entity_type: &str,
        domain: &Domain,
        limit: usize,
    ) -> Result<Vec<RecordId>, TransportError>;

    /// Create a record and return its new id.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] on connectivity or remote failure.
    fn create(&self, entity_type: &str, payload: &Payload) -> Result<RecordId, TransportError>;

    /// Write `payload` onto an existing record.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] on connectivity or remote failure.
    fn update(
        &self,
        entity_type: &str,
        id: RecordId,
        payload: &Payload,
    ) -> Result<(), TransportError>;
}
