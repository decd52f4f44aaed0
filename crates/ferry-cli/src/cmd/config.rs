use anyhow::{Context, Result};
use ferry_core::config::LoadedConfig;
use serde::Serialize;

use crate::output::OutputMode;

#[derive(Debug, Serialize)]
struct ConfigView<'a> {
    /// `None` when no file was found and defaults apply.
    file: Option<String>,
    config: &'a ferry_core::config::FerryConfig,
}

/// Print the effective configuration with passwords redacted.
pub fn run_config(loaded: &LoadedConfig, output: OutputMode) -> Result<()> {
    let redacted = loaded.config.redacted();
    let file = loaded.path.as_ref().map(|path| path.display().to_string());

    if output.is_json() {
        let view = ConfigView {
            file,
            config: &redacted,
        };
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    match &file {
        Some(file) => println!("# loaded from {file}"),
        None => println!("# no config file found; built-in defaults"),
    }
    let text = toml::to_string_pretty(&redacted).context("Failed to render config as TOML")?;
    print!("{text}");
    Ok(())
}
