pub mod completions;
pub mod config;
pub mod mappings;
pub mod plan;
pub mod run;
pub mod seed;

use anyhow::{Context, Result};
use ferry_core::MappingStore;
use ferry_core::config::FerryConfig;

use crate::odoo::OdooRecordStore;

/// Log in to both instances named in the config.
pub fn connect_both(config: &FerryConfig) -> Result<(OdooRecordStore, OdooRecordStore)> {
    let language = &config.settings.language;
    let source = OdooRecordStore::connect("source", config.source()?, language)
        .context("Failed to connect to the source instance")?;
    let destination = OdooRecordStore::connect("destination", config.destination()?, language)
        .context("Failed to connect to the destination instance")?;
    Ok((source, destination))
}

pub fn open_mappings(config: &FerryConfig) -> Result<MappingStore> {
    let dir = &config.settings.mappings_dir;
    MappingStore::open(dir)
        .with_context(|| format!("Failed to open mapping directory {}", dir.display()))
}
