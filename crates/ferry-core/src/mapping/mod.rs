//! Durable source id → destination id tables, one file per entity type.
//!
//! Tables are loaded lazily the first time an entity type is touched and are
//! buffered in memory until [`MappingStore::flush`]. The files are a cache:
//! the authoritative correlation lives in the source record's back-reference
//! field, so a lost or quarantined table is rebuilt by the next run.
//!
//! # Layout
//!
//! ```text
//! <mappings_dir>/
//! ├── .lock                    # exclusive advisory lock (fs2)
//! ├── res.users.map            # see `format` for the line format
//! └── res.partner.map.corrupt  # quarantined unreadable table
//! ```

pub mod format;

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{MigrateError, StorageError};
use crate::lock::MappingDirLock;
use crate::model::{Domain, RecordId};
use crate::store::{DEFAULT_ORDER, RecordStore};

pub use format::MappingTable;

/// File extension of mapping tables.
pub const MAPPING_EXTENSION: &str = "map";

/// How long [`MappingStore::open`] waits for another process to release the
/// mapping directory.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const LOCK_FILE: &str = ".lock";

#[derive(Debug, Default)]
struct TableState {
    entries: MappingTable,
    dirty: bool,
    /// The file on disk could not be read; move it aside before the next write.
    quarantine: bool,
}

/// Per-entity-type mapping tables backed by `<dir>/<entity_type>.map`.
#[derive(Debug)]
pub struct MappingStore {
    dir: PathBuf,
    tables: HashMap<String, TableState>,
    lock: MappingDirLock,
}

impl MappingStore {
    /// Open (and create) a mapping directory, taking its lock.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the directory cannot be created or
    /// [`StorageError::Lock`] if another process holds it.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        Self::open_with_timeout(dir, DEFAULT_LOCK_TIMEOUT)
    }

    /// Like [`MappingStore::open`] with an explicit lock timeout.
    ///
    /// # Errors
    ///
    /// See [`MappingStore::open`].
    pub fn open_with_timeout(
        dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;
        let lock = MappingDirLock::acquire(&dir.join(LOCK_FILE), timeout)?;
        debug!(dir = %dir.display(), "mapping directory opened");
        Ok(Self {
            dir,
            tables: HashMap::new(),
            lock,
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn lock_path(&self) -> &Path {
        self.lock.path()
    }

    /// File backing `entity_type`'s table.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidEntityType`] when the name cannot be
    /// used as a file name.
    pub fn mapping_path(&self, entity_type: &str) -> Result<PathBuf, StorageError> {
        validate_entity_type(entity_type)?;
        Ok(self
            .dir
            .join(format!("{entity_type}.{MAPPING_EXTENSION}")))
    }

    // -----------------------------------------------------------------------
    // Reads and writes
    // -----------------------------------------------------------------------

    /// Destination id previously recorded for `source_id`. Never touches the
    /// network. An unreadable file degrades to an empty table.
    pub fn get(&mut self, entity_type: &str, source_id: RecordId) -> Option<RecordId> {
        self.ensure_loaded(entity_type)
            .entries
            .get(&source_id)
            .copied()
    }

    /// Record (or overwrite) the destination id for `source_id`.
    pub fn set(&mut self, entity_type: &str, source_id: RecordId, dest_id: RecordId) {
        let state = self.ensure_loaded(entity_type);
        let previous = state.entries.insert(source_id, dest_id);
        if previous != Some(dest_id) {
            state.dirty = true;
            if let Some(old) = previous {
                debug!(entity_type, %source_id, %old, %dest_id, "mapping overwritten");
            }
        }
    }

    /// Load `entity_type`'s table if it is not loaded yet and return its size.
    ///
    /// A missing file is an empty table.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the file exists but cannot be read or
    /// parsed. The table is left unloaded.
    pub fn load(&mut self, entity_type: &str) -> Result<usize, StorageError> {
        if let Some(state) = self.tables.get(entity_type) {
            return Ok(state.entries.len());
        }
        let entries = self.read_table(entity_type)?;
        let count = entries.len();
        debug!(entity_type, count, "mapping table loaded");
        self.tables.insert(
            entity_type.to_string(),
            TableState {
                entries,
                ..TableState::default()
            },
        );
        Ok(count)
    }

    /// Read-only view of a table, loading it first.
    ///
    /// # Errors
    ///
    /// See [`MappingStore::load`].
    pub fn table(&mut self, entity_type: &str) -> Result<&MappingTable, StorageError> {
        self.load(entity_type)?;
        self.tables
            .get(entity_type)
            .map(|state| &state.entries)
            .ok_or_else(|| StorageError::InvalidEntityType(entity_type.to_string()))
    }

    /// Parse the file on disk without caching it. Used by `mappings verify`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the file cannot be read or parsed.
    pub fn verify(&self, entity_type: &str) -> Result<usize, StorageError> {
        self.read_table(entity_type).map(|table| table.len())
    }

    /// Entity types that have a mapping file, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the directory cannot be listed.
    pub fn stored_entity_types(&self) -> Result<Vec<String>, StorageError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| StorageError::io(&self.dir, e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(&self.dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(MAPPING_EXTENSION) {
                continue;
            }
            if let Some(stem) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .filter(|stem| is_valid_entity_type(stem))
            {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Write `entity_type`'s table if it changed since the last flush and
    /// return the number of entries written.
    ///
    /// The table is written to a temporary file renamed into place. An
    /// unreadable file found at load time is first moved to
    /// `<entity_type>.map.corrupt`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on any I/O failure. The in-memory table stays
    /// dirty so a later flush can retry.
    pub fn flush(&mut self, entity_type: &str) -> Result<usize, StorageError> {
        let path = self.mapping_path(entity_type)?;
        let Some(state) = self.tables.get_mut(entity_type) else {
            return Ok(0);
        };
        if !state.dirty {
            return Ok(0);
        }

        if state.quarantine {
            let backup = path.with_extension(format!("{MAPPING_EXTENSION}.corrupt"));
            match fs::rename(&path, &backup) {
                Ok(()) => {
                    warn!(
                        entity_type,
                        backup = %backup.display(),
                        "unreadable mapping file quarantined"
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::io(&path, e)),
            }
            state.quarantine = false;
        }

        let tmp = path.with_extension(format!("{MAPPING_EXTENSION}.tmp"));
        fs::write(&tmp, format::format_table(&state.entries))
            .map_err(|e| StorageError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| StorageError::io(&path, e))?;

        state.dirty = false;
        let count = state.entries.len();
        debug!(entity_type, count, path = %path.display(), "mapping table flushed");
        Ok(count)
    }

    /// Flush every loaded table. Every table is attempted; failures are
    /// logged and the first one is returned.
    ///
    /// # Errors
    ///
    /// Returns the first [`StorageError`] encountered.
    pub fn flush_all(&mut self) -> Result<usize, StorageError> {
        let mut names: Vec<String> = self.tables.keys().cloned().collect();
        names.sort();

        let mut written = 0;
        let mut first_error = None;
        for name in names {
            match self.flush(&name) {
                Ok(count) => written += count,
                Err(e) => {
                    warn!(entity_type = %name, error = %e, code = %e.code(), "mapping flush failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(written), Err)
    }

    // -----------------------------------------------------------------------
    // Seeding
    // -----------------------------------------------------------------------

    /// Seed `entity_type`'s table by natural-key matching alone.
    ///
    /// Every source record is read page by page (terminating on an empty
    /// page); the destination is searched for `key_field = value` and the
    /// first match is recorded. Records whose key is a many2one reference
    /// are left unseeded, since a source-side id cannot be compared with
    /// destination ids. Returns the number of seeded entries.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::Transport`] if either store fails. Entries
    /// seeded before the failure stay in memory.
    pub fn bulk_populate_from_remote(
        &mut self,
        source: &dyn RecordStore,
        destination: &dyn RecordStore,
        entity_type: &str,
        key_field: &str,
        page_size: usize,
    ) -> Result<usize, MigrateError> {
        let page_size = page_size.max(1);
        let filter = Domain::new();
        let mut offset = 0;
        let mut seeded = 0;

        loop {
            let page = source.fetch_page(entity_type, &filter, offset, page_size, DEFAULT_ORDER)?;
            if page.is_empty() {
                break;
            }
            for record in &page {
                let Some(value) = record
                    .field(key_field)
                    .filter(|v| !crate::model::is_empty_value(v))
                else {
                    debug!(entity_type, source_id = %record.id, key_field, "no key value, not seeded");
                    continue;
                };
                if value.is_array() {
                    warn!(
                        entity_type,
                        source_id = %record.id,
                        key_field,
                        "key field is a reference, source ids mean nothing in the destination; not seeded"
                    );
                    continue;
                }

                let hits =
                    destination.search(entity_type, &Domain::eq(key_field, value.clone()), 1)?;
                if let Some(dest_id) = hits.first() {
                    self.set(entity_type, record.id, *dest_id);
                    seeded += 1;
                }
            }
            offset += page_size;
        }

        info!(entity_type, key_field, seeded, "mapping table seeded");
        Ok(seeded)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn ensure_loaded(&mut self, entity_type: &str) -> &mut TableState {
        if !self.tables.contains_key(entity_type) {
            let state = match self.read_table(entity_type) {
                Ok(entries) => TableState {
                    entries,
                    ..TableState::default()
                },
                Err(e) => {
                    warn!(
                        entity_type,
                        error = %e,
                        code = %e.code(),
                        "mapping table unreadable, starting empty"
                    );
                    TableState {
                        quarantine: matches!(
                            e,
                            StorageError::Corrupt { .. } | StorageError::Io { .. }
                        ),
                        ..TableState::default()
                    }
                }
            };
            self.tables.insert(entity_type.to_string(), state);
        }
        self.tables
            .entry(entity_type.to_string())
            .or_default()
    }

    fn read_table(&self, entity_type: &str) -> Result<MappingTable, StorageError> {
        let path = self.mapping_path(entity_type)?;
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(MappingTable::new()),
            Err(e) => return Err(StorageError::io(&path, e)),
        };
        format::parse_table(&content).map_err(|e| StorageError::Corrupt {
            path,
            reason: e.to_string(),
        })
    }
}

impl Drop for MappingStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush_all() {
            warn!(error = %e, "mapping tables not fully flushed at shutdown");
        }
    }
}

/// Entity type names become file names: ASCII alphanumerics, `.`, `_` and
/// `-` only, not starting with a dot.
#[must_use]
pub fn is_valid_entity_type(entity_type: &str) -> bool {
    !entity_type.is_empty()
        && !entity_type.starts_with('.')
        && entity_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn validate_entity_type(entity_type: &str) -> Result<(), StorageError> {
    if is_valid_entity_type(entity_type) {
        Ok(())
    } else {
        Err(StorageError::InvalidEntityType(entity_type.to_string()))
    }
}
