#![forbid(unsafe_code)]

mod cmd;
mod odoo;
mod output;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use ferry_core::config::{Settings, load_config};
use output::{CliError, OutputMode};
use std::env;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "ferry: idempotent record migration between two Odoo instances",
    long_about = None
)]
struct Cli {
    /// Config file (default: ./ferry.toml, then the user config directory).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    const fn output_mode(&self) -> OutputMode {
        OutputMode::from_json_flag(self.json)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Migrate records from source to destination",
        long_about = "Connect to both instances, seed the configured mapping tables, then migrate every requested entity type in dependency order. Re-running never duplicates records.",
        after_help = "EXAMPLES:\n    # Migrate everything in settings.order\n    ferry run\n\n    # Migrate partners only, 500 per page\n    ferry run --only res.partner --page-size 500\n\n    # Emit the run report as JSON\n    ferry run --json"
    )]
    Run(cmd::run::RunArgs),

    #[command(
        about = "Fill one mapping table by matching a key field",
        long_about = "Correlate records that already exist on both sides by an identifying field, without creating or updating anything.",
        after_help = "EXAMPLES:\n    # Correlate users by login\n    ferry seed res.users --key login"
    )]
    Seed(cmd::seed::SeedArgs),

    #[command(
        about = "Print the resolved migration order",
        after_help = "EXAMPLES:\n    # Order for the configured entity types\n    ferry plan\n\n    # Order for a subset\n    ferry plan --only res.users --only res.groups"
    )]
    Plan(cmd::plan::PlanArgs),

    #[command(about = "Inspect mapping tables")]
    Mappings(cmd::mappings::MappingsArgs),

    #[command(
        about = "Print the effective configuration",
        long_about = "Print the configuration after file lookup, defaults and environment overrides. Passwords are redacted."
    )]
    Config,

    #[command(
        about = "Generate shell completion scripts",
        after_help = "EXAMPLES:\n    # Generate bash completions\n    ferry completions bash"
    )]
    Completions(cmd::completions::CompletionsArgs),
}

fn init_tracing(verbose: bool, settings: &Settings) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env("FERRY_LOG").unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::try_new(&settings.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
        }
    });

    let file_layer = match &settings.log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    let format = env::var("FERRY_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());
    let registry = tracing_subscriber::registry().with(filter).with(file_layer);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(io::stderr))
                .init();
        }
    }
    Ok(())
}

fn run(cli: Cli) -> anyhow::Result<()> {
    if let Commands::Completions(args) = &cli.command {
        let mut command = Cli::command();
        return cmd::completions::run_completions(args.shell, &mut command, &mut io::stdout());
    }

    let loaded = load_config(cli.config.as_deref())?;
    init_tracing(cli.verbose, &loaded.config.settings)?;
    if let Some(path) = &loaded.path {
        debug!(path = %path.display(), "config loaded");
    }

    let output = cli.output_mode();
    let config = &loaded.config;
    match &cli.command {
        Commands::Run(args) => cmd::run::run_run(args, config, output),
        Commands::Seed(args) => cmd::seed::run_seed(args, config, output),
        Commands::Plan(args) => cmd::plan::run_plan(args, config, output),
        Commands::Mappings(args) => cmd::mappings::run_mappings(args, config, output),
        Commands::Config => cmd::config::run_config(&loaded, output),
        Commands::Completions(_) => Ok(()),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let output = cli.output_mode();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if output::render_error(output, &CliError::from(&err)).is_err() {
                eprintln!("error: {err:#}");
            }
            ExitCode::FAILURE
        }
    }
}
