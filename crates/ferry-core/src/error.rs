use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::lock::LockError;
use crate::model::RecordId;

/// Machine-readable error codes, stable across releases so migration logs can
/// be grepped and triaged without parsing prose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    ConfigInvalid,
    DependencyCycle,
    HandlerNotConfigured,
    ResourceNotFound,
    TransportFailed,
    RemoteFault,
    MappingFileIo,
    MappingFileCorrupt,
    LockContention,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`F####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "F1001",
            Self::ConfigInvalid => "F1002",
            Self::DependencyCycle => "F1003",
            Self::HandlerNotConfigured => "F2001",
            Self::ResourceNotFound => "F2002",
            Self::TransportFailed => "F3001",
            Self::RemoteFault => "F3002",
            Self::MappingFileIo => "F4001",
            Self::MappingFileCorrupt => "F4002",
            Self::LockContention => "F4003",
            Self::InternalUnexpected => "F9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::ConfigInvalid => "Invalid configuration value",
            Self::DependencyCycle => "Entity types depend on each other in a cycle",
            Self::HandlerNotConfigured => "No handler registered for entity type",
            Self::ResourceNotFound => "Record could not be resolved",
            Self::TransportFailed => "Record system unreachable",
            Self::RemoteFault => "Record system rejected the call",
            Self::MappingFileIo => "Mapping file I/O failed",
            Self::MappingFileCorrupt => "Mapping file is corrupt",
            Self::LockContention => "Mapping directory is locked",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in ferry.toml and retry."),
            Self::ConfigInvalid => Some("Run `ferry config` to inspect the effective settings."),
            Self::DependencyCycle => {
                Some("Remove one depends_on or reference edge so the entity graph is acyclic.")
            }
            Self::HandlerNotConfigured => {
                Some("Declare the entity type under [[entities]] or drop it from `order`.")
            }
            Self::ResourceNotFound => Some("Migrate the referenced entity type first, then re-run."),
            Self::TransportFailed => Some("Check host, port and credentials, then re-run."),
            Self::RemoteFault => None,
            Self::MappingFileIo => Some("Check disk space and write permissions on mappings_dir."),
            Self::MappingFileCorrupt => {
                Some("The file was quarantined as *.corrupt; re-run to rebuild it from back-references.")
            }
            Self::LockContention => Some("Wait for the other ferry process to finish."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

// ---------------------------------------------------------------------------
// TransportError
// ---------------------------------------------------------------------------

/// Failure talking to a record system.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The endpoint could not be reached or authentication failed.
    #[error("connection to {endpoint} failed: {message}")]
    Connect { endpoint: String, message: String },

    /// The remote side answered with a fault.
    #[error("{method} on {entity_type} failed: {message}")]
    Remote {
        entity_type: String,
        method: String,
        message: String,
    },

    /// The answer could not be decoded.
    #[error("malformed response to {method}: {message}")]
    Decode { method: String, message: String },
}

impl TransportError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Connect { .. } => ErrorCode::TransportFailed,
            Self::Remote { .. } | Self::Decode { .. } => ErrorCode::RemoteFault,
        }
    }

    /// True when the endpoint itself is gone, as opposed to one call being
    /// rejected or answered badly.
    #[must_use]
    pub const fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Connect { .. })
    }
}

// ---------------------------------------------------------------------------
// StorageError
// ---------------------------------------------------------------------------

/// Failure reading or writing mapping files.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("mapping file I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt mapping file {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("entity type '{0}' cannot be used as a mapping file name")]
    InvalidEntityType(String),

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl StorageError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Io { .. } | Self::InvalidEntityType(_) => ErrorCode::MappingFileIo,
            Self::Corrupt { .. } => ErrorCode::MappingFileCorrupt,
            Self::Lock(err) => err.code(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// MigrateError
// ---------------------------------------------------------------------------

/// Errors raised while migrating entity types.
///
/// [`MigrateError::ResourceNotFound`] is record-scoped: the pipeline skips the
/// record and continues. Every other variant is entity-scoped.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{entity_type} record {source_id}: {reason}")]
    ResourceNotFound {
        entity_type: String,
        source_id: RecordId,
        reason: String,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("no handler registered for entity type '{0}'")]
    HandlerNotConfigured(String),
}

impl MigrateError {
    pub fn not_found(entity_type: &str, source_id: RecordId, reason: impl Into<String>) -> Self {
        Self::ResourceNotFound {
            entity_type: entity_type.to_string(),
            source_id,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Transport(err) => err.code(),
            Self::ResourceNotFound { .. } => ErrorCode::ResourceNotFound,
            Self::Storage(err) => err.code(),
            Self::HandlerNotConfigured(_) => ErrorCode::HandlerNotConfigured,
        }
    }

    /// True when the error only affects the record being processed.
    #[must_use]
    pub const fn is_record_scoped(&self) -> bool {
        matches!(self, Self::ResourceNotFound { .. })
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Invalid configuration detected before any record is touched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("entity types depend on each other in a cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Invalid { .. } => ErrorCode::ConfigInvalid,
            Self::Cycle(_) => ErrorCode::DependencyCycle,
        }
    }
}
