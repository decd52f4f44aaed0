use anyhow::{Context, Result, bail};
use clap::Args;
use ferry_core::config::FerryConfig;
use ferry_core::mapping::is_valid_entity_type;
use ferry_core::pipeline::SeedReport;
use tracing::info;

use crate::cmd::{connect_both, open_mappings};
use crate::output::{self, OutputMode};

#[derive(Args, Debug)]
pub struct SeedArgs {
    /// Entity type whose mapping table is filled, e.g. `res.users`.
    #[arg(value_name = "ENTITY")]
    pub entity_type: String,

    /// Field whose value identifies the same record on both sides.
    #[arg(long, value_name = "FIELD")]
    pub key: String,
}

/// Match every source record to a destination record by `--key` and write
/// the table.
pub fn run_seed(args: &SeedArgs, config: &FerryConfig, output: OutputMode) -> Result<()> {
    if !is_valid_entity_type(&args.entity_type) {
        bail!("'{}' is not a usable entity type name", args.entity_type);
    }
    if args.key.trim().is_empty() {
        bail!("--key must name a field");
    }

    let (source, destination) = connect_both(config)?;
    let mut mappings = open_mappings(config)?;

    let seeded = mappings
        .bulk_populate_from_remote(
            &source,
            &destination,
            &args.entity_type,
            &args.key,
            config.settings.page_size,
        )
        .with_context(|| format!("Failed to seed {}", args.entity_type))?;
    let written = mappings
        .flush(&args.entity_type)
        .with_context(|| format!("Failed to write the {} mapping table", args.entity_type))?;
    info!(entity_type = %args.entity_type, seeded, written, "seed complete");

    let report = SeedReport {
        entity_type: args.entity_type.clone(),
        key_field: args.key.clone(),
        seeded,
        error: None,
    };
    output::render(output, &report, |report, w| {
        writeln!(
            w,
            "Seeded {} {} correlation(s) by matching {}.",
            report.seeded, report.entity_type, report.key_field
        )
    })
}
