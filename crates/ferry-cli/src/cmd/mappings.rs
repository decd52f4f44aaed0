use anyhow::{Context, Result, bail};
use clap::{Args, Subcommand};
use ferry_core::config::FerryConfig;
use ferry_core::model::RecordId;
use serde::Serialize;
use std::path::PathBuf;

use crate::cmd::open_mappings;
use crate::output::{self, OutputMode};

#[derive(Args, Debug)]
pub struct MappingsArgs {
    #[command(subcommand)]
    pub command: MappingsCommand,
}

#[derive(Subcommand, Debug)]
pub enum MappingsCommand {
    /// Print one entity type's source → destination table
    Show {
        /// Entity type, e.g. `res.partner`.
        #[arg(value_name = "ENTITY")]
        entity_type: String,
    },
    /// Parse every mapping file and report entry counts or errors
    Verify,
}

#[derive(Debug, Serialize)]
struct TableView {
    entity_type: String,
    path: PathBuf,
    entries: Vec<EntryView>,
}

#[derive(Debug, Serialize)]
struct EntryView {
    source_id: RecordId,
    dest_id: RecordId,
}

#[derive(Debug, Serialize)]
struct VerifyLine {
    entity_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    entries: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<&'static str>,
}

pub fn run_mappings(args: &MappingsArgs, config: &FerryConfig, output: OutputMode) -> Result<()> {
    match &args.command {
        MappingsCommand::Show { entity_type } => run_show(entity_type, config, output),
        MappingsCommand::Verify => run_verify(config, output),
    }
}

fn run_show(entity_type: &str, config: &FerryConfig, output: OutputMode) -> Result<()> {
    let mut store = open_mappings(config)?;
    let path = store.mapping_path(entity_type)?;
    let entries = store
        .table(entity_type)
        .with_context(|| format!("Failed to read {}", path.display()))?
        .iter()
        .map(|(source_id, dest_id)| EntryView {
            source_id: *source_id,
            dest_id: *dest_id,
        })
        .collect();
    let view = TableView {
        entity_type: entity_type.to_string(),
        path,
        entries,
    };

    output::render(output, &view, |view, w| {
        output::section(w, &format!("{} ({})", view.entity_type, view.path.display()))?;
        if view.entries.is_empty() {
            return writeln!(w, "(no correlations)");
        }
        writeln!(w, "{:>12}  {:>12}", "SOURCE", "DESTINATION")?;
        for entry in &view.entries {
            writeln!(w, "{:>12}  {:>12}", entry.source_id, entry.dest_id)?;
        }
        writeln!(w, "{} correlation(s)", view.entries.len())
    })
}

fn run_verify(config: &FerryConfig, output: OutputMode) -> Result<()> {
    let store = open_mappings(config)?;
    let lines: Vec<VerifyLine> = store
        .stored_entity_types()?
        .into_iter()
        .map(|entity_type| match store.verify(&entity_type) {
            Ok(entries) => VerifyLine {
                entity_type,
                entries: Some(entries),
                error: None,
                error_code: None,
            },
            Err(e) => VerifyLine {
                entity_type,
                entries: None,
                error: Some(e.to_string()),
                error_code: Some(e.code().code()),
            },
        })
        .collect();

    output::render(output, &lines, |lines, w| {
        output::section(w, &format!("Mapping files in {}", store.dir().display()))?;
        if lines.is_empty() {
            return writeln!(w, "(none)");
        }
        for line in lines {
            match (&line.entries, &line.error) {
                (Some(entries), _) => writeln!(w, "ok      {:<34} {entries}", line.entity_type)?,
                (None, Some(error)) => writeln!(w, "FAILED  {:<34} {error}", line.entity_type)?,
                (None, None) => {}
            }
        }
        Ok(())
    })?;

    let failed = lines.iter().filter(|line| line.error.is_some()).count();
    if failed > 0 {
        bail!("{failed} mapping file(s) failed verification");
    }
    Ok(())
}
