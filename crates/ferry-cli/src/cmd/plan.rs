use anyhow::Result;
use clap::Args;
use ferry_core::config::FerryConfig;
use ferry_core::plan::migration_order;
use serde::Serialize;

use crate::cmd::run::requested;
use crate::output::{self, OutputMode};

#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Plan only this entity type (repeatable). Defaults to `settings.order`.
    #[arg(long = "only", value_name = "ENTITY")]
    pub only: Vec<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct PlanStep {
    pub position: usize,
    pub entity_type: String,
    /// False when nothing would migrate this entity type.
    pub registered: bool,
    pub depends_on: Vec<String>,
}

/// Resolve the migration order without touching either instance.
///
/// # Errors
///
/// Returns an error when the requested entity types depend on each other in
/// a cycle.
pub fn build_plan(only: &[String], config: &FerryConfig) -> Result<Vec<PlanStep>> {
    let registry = config.registry();
    let order = migration_order(&requested(only, config), &registry)?;
    Ok(order
        .into_iter()
        .enumerate()
        .map(|(index, entity_type)| {
            let dependencies = registry.dependencies(&entity_type);
            PlanStep {
                position: index + 1,
                registered: dependencies.is_some(),
                depends_on: dependencies.unwrap_or_default(),
                entity_type,
            }
        })
        .collect())
}

pub fn run_plan(args: &PlanArgs, config: &FerryConfig, output: OutputMode) -> Result<()> {
    let steps = build_plan(&args.only, config)?;
    output::render(output, &steps, |steps, w| {
        output::section(w, "Migration order")?;
        for step in steps {
            let note = if !step.registered {
                " (no handler, will be skipped)".to_string()
            } else if step.depends_on.is_empty() {
                String::new()
            } else {
                format!(" <- {}", step.depends_on.join(", "))
            };
            writeln!(w, "{:>3}. {}{note}", step.position, step.entity_type)?;
        }
        Ok(())
    })
}
