use anyhow::Result;
use clap::Args;
use clap_complete::{Shell, generate};
use std::io::Write;

/// Arguments for `ferry completions`.
#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Target shell for completion script generation.
    #[arg(value_enum)]
    pub shell: Shell,
}

/// Write the completion script for `shell` to `out`.
///
/// # Errors
///
/// Returns an error if flushing `out` fails.
pub fn run_completions(shell: Shell, command: &mut clap::Command, out: &mut dyn Write) -> Result<()> {
    generate(shell, command, "ferry", out);
    out.flush()?;
    Ok(())
}
