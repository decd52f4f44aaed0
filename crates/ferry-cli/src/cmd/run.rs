use anyhow::{Result, bail};
use clap::Args;
use ferry_core::config::FerryConfig;
use ferry_core::Pipeline;
use ferry_core::pipeline::{EntityStatus, RunReport};
use std::io::{self, Write};
use tracing::warn;

use crate::cmd::{connect_both, open_mappings};
use crate::output::{self, OutputMode};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Migrate only this entity type (repeatable). Defaults to `settings.order`.
    #[arg(long = "only", value_name = "ENTITY")]
    pub only: Vec<String>,

    /// Records per page, overriding `settings.page_size`.
    #[arg(long, value_name = "N")]
    pub page_size: Option<usize>,

    /// Skip the `[[seed]]` tables.
    #[arg(long)]
    pub no_seed: bool,
}

/// Entity types to migrate: `--only` when given, else the configured order.
pub fn requested(only: &[String], config: &FerryConfig) -> Vec<String> {
    if only.is_empty() {
        config.requested_order()
    } else {
        only.to_vec()
    }
}

/// Connect, seed and migrate.
///
/// Per-entity failures end up in the report; only connection, lock and
/// configuration problems make this return an error.
pub fn run_run(args: &RunArgs, config: &FerryConfig, output: OutputMode) -> Result<()> {
    let mut options = config.pipeline_options();
    if let Some(page_size) = args.page_size {
        if page_size == 0 {
            bail!("--page-size must be at least 1");
        }
        options.page_size = page_size;
    }
    let requested = requested(&args.only, config);
    let seeds = if args.no_seed { &[][..] } else { &config.seed[..] };

    let (source, destination) = connect_both(config)?;
    let registry = config.registry();
    let mut mappings = open_mappings(config)?;

    let report = Pipeline::new(&source, &destination, &registry, &mut mappings, options)
        .run_with_seeds(&requested, seeds)?;

    if let Err(e) = mappings.flush_all() {
        warn!(code = %e.code(), error = %e, "final mapping flush failed");
    }

    output::render(output, &report, render_report)
}

fn render_report(report: &RunReport, w: &mut dyn Write) -> io::Result<()> {
    if !report.seeds.is_empty() {
        output::section(w, "Seeded mapping tables")?;
        for seed in &report.seeds {
            match &seed.error {
                Some(error) => writeln!(w, "{:<34} failed: {error}", seed.entity_type)?,
                None => writeln!(
                    w,
                    "{:<34} {} matched on {}",
                    seed.entity_type, seed.seeded, seed.key_field
                )?,
            }
        }
        writeln!(w)?;
    }

    output::section(w, "Migration")?;
    writeln!(
        w,
        "{:<34} {:<10} {:>7} {:>7} {:>7} {:>7}",
        "ENTITY", "STATUS", "READ", "CREATED", "UPDATED", "SKIPPED"
    )?;
    for entity in &report.entities {
        writeln!(
            w,
            "{:<34} {:<10} {:>7} {:>7} {:>7} {:>7}",
            entity.entity_type,
            status_label(entity.status),
            entity.records,
            entity.created,
            entity.updated,
            entity.skipped
        )?;
        if let Some(error) = &entity.error {
            let code = entity.error_code.unwrap_or("-");
            writeln!(w, "  [{code}] {error}")?;
        }
    }
    output::rule(w)?;
    let elapsed = (report.finished_at - report.started_at)
        .to_std()
        .unwrap_or_default();
    writeln!(
        w,
        "{} created, {} updated, {} skipped in {:.1}s",
        report.created(),
        report.updated(),
        report.skipped(),
        elapsed.as_secs_f64()
    )?;
    if !report.is_clean() {
        writeln!(w, "Some entity types did not complete; re-run to resume them.")?;
    }
    Ok(())
}

const fn status_label(status: EntityStatus) -> &'static str {
    match status {
        EntityStatus::Completed => "completed",
        EntityStatus::Aborted => "aborted",
        EntityStatus::Skipped => "skipped",
    }
}
