//! ferry-core library.
//!
//! Moves records between two systems of record without ever duplicating an
//! already-migrated record:
//!
//! - [`store`]: the [`RecordStore`](store::RecordStore) seam and an in-memory
//!   implementation.
//! - [`mapping`]: durable source id → destination id tables.
//! - [`handler`]: per-entity-type transformation into pending writes.
//! - [`reconcile`]: the shared create-or-update decision.
//! - [`pipeline`]: the paginated fetch → transform → reconcile → flush loop.
//!
//! # Conventions
//!
//! - **Errors**: typed `thiserror` enums in [`error`], each mapped to a stable
//!   [`ErrorCode`](error::ErrorCode). `anyhow::Result` only where a config
//!   file is read.
//! - **Logging**: `tracing` macros with `entity_type` and `source_id` fields.

pub mod config;
pub mod error;
pub mod handler;
pub mod lock;
pub mod mapping;
pub mod model;
pub mod pipeline;
pub mod plan;
pub mod reconcile;
pub mod store;

pub use error::{ConfigError, ErrorCode, MigrateError, StorageError, TransportError};
pub use mapping::MappingStore;
pub use model::{Domain, RecordId, SourceRecord};
pub use pipeline::{Pipeline, PipelineOptions, RunReport};
pub use store::{MemoryRecordStore, RecordStore};
