//! Mapping file line format.
//!
//! # Format (v1)
//!
//! ```text
//! # ferry mapping v1
//! source_id \t dest_id
//! ```
//!
//! - The first line is the header. A file without a header is read as v1.
//! - Lines starting with `#` and blank lines are skipped.
//! - Each data line holds exactly two positive ids separated by one tab.
//! - The writer emits entries sorted by source id, one per line, with a
//!   trailing newline.

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;

use crate::model::RecordId;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Header line written at the top of every `.map` file.
pub const MAPPING_HEADER: &str = "# ferry mapping v1";

/// Field delimiter shared by the writer and the parser.
pub const DELIMITER: char = '\t';

/// Newest format version this build can read.
pub const CURRENT_VERSION: u32 = 1;

const HEADER_PREFIX: &str = "# ferry mapping v";

/// source id → destination id for one entity type.
pub type MappingTable = BTreeMap<RecordId, RecordId>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while parsing a mapping file. Line numbers are 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A data line does not hold exactly two fields.
    FieldCount { line: usize, found: usize },
    /// A field is not a positive integer.
    InvalidId { line: usize, raw: String },
    /// The same source id appears twice.
    DuplicateSource { line: usize, source_id: RecordId },
    /// The header names a version newer than [`CURRENT_VERSION`].
    UnsupportedVersion(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FieldCount { line, found } => {
                write!(f, "line {line}: expected 2 tab-separated fields, found {found}")
            }
            Self::InvalidId { line, raw } => {
                write!(f, "line {line}: not a positive record id: '{raw}'")
            }
            Self::DuplicateSource { line, source_id } => {
                write!(f, "line {line}: source id {source_id} already mapped")
            }
            Self::UnsupportedVersion(header) => {
                write!(
                    f,
                    "unsupported mapping header '{header}' (this build reads up to v{CURRENT_VERSION})"
                )
            }
        }
    }
}

impl std::error::Error for ParseError {}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Render a table as mapping file content.
#[must_use]
pub fn format_table(table: &MappingTable) -> String {
    let mut out = String::with_capacity(MAPPING_HEADER.len() + 1 + table.len() * 12);
    out.push_str(MAPPING_HEADER);
    out.push('\n');
    for (source, dest) in table {
        let _ = writeln!(out, "{source}{DELIMITER}{dest}");
    }
    out
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parse mapping file content into a table.
///
/// # Errors
///
/// Returns the first [`ParseError`] found. A table is never partially
/// returned.
pub fn parse_table(input: &str) -> Result<MappingTable, ParseError> {
    let mut table = MappingTable::new();

    for (index, raw_line) in input.lines().enumerate() {
        let line_no = index + 1;
        let line = raw_line.trim_end_matches('\r');
        let trimmed = line.trim();

        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with('#') {
            if index == 0 {
                check_header(trimmed)?;
            }
            continue;
        }

        let fields: Vec<&str> = line.split(DELIMITER).collect();
        if fields.len() != 2 {
            return Err(ParseError::FieldCount {
                line: line_no,
                found: fields.len(),
            });
        }

        let source = parse_id(fields[0], line_no)?;
        let dest = parse_id(fields[1], line_no)?;
        if table.insert(source, dest).is_some() {
            return Err(ParseError::DuplicateSource {
                line: line_no,
                source_id: source,
            });
        }
    }

    Ok(table)
}

fn parse_id(raw: &str, line: usize) -> Result<RecordId, ParseError> {
    raw.parse().map_err(|_| ParseError::InvalidId {
        line,
        raw: raw.to_string(),
    })
}

/// Only a `# ferry mapping vN` header is versioned; any other leading
/// comment is ignored like the rest.
fn check_header(line: &str) -> Result<(), ParseError> {
    let Some(version) = line.strip_prefix(HEADER_PREFIX) else {
        return Ok(());
    };
    match version.trim().parse::<u32>() {
        Ok(v) if v <= CURRENT_VERSION => Ok(()),
        _ => Err(ParseError::UnsupportedVersion(line.to_string())),
    }
}
