use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::handler::builtin::DEFAULT_ORDER;
use crate::handler::{EntitySpec, HandlerRegistry, HandlerSettings};
use crate::mapping::is_valid_entity_type;
use crate::pipeline::PipelineOptions;

/// File looked up in the working directory when `--config` is not given.
pub const CONFIG_FILE_NAME: &str = "ferry.toml";

pub const SOURCE_PASSWORD_ENV: &str = "FERRY_SOURCE_PASSWORD";
pub const DESTINATION_PASSWORD_ENV: &str = "FERRY_DESTINATION_PASSWORD";

const REDACTED: &str = "********";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FerryConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<EndpointConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<EndpointConfig>,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub seed: Vec<SeedConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<EntitySpec>,
}

/// Connection to one Odoo instance.
#[derive(Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub https: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl EndpointConfig {
    /// Base URL, e.g. `http://localhost:8069`.
    #[must_use]
    pub fn url(&self) -> String {
        let scheme = if self.https { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &REDACTED)
            .field("https", &self.https)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_mappings_dir")]
    pub mappings_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<i64>,
    #[serde(default = "default_back_reference_field")]
    pub back_reference_field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_id_field: Option<String>,
    /// Entity types to migrate. Defaults to the built-in order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<Vec<String>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            mappings_dir: default_mappings_dir(),
            log_file: None,
            log_level: default_log_level(),
            language: default_language(),
            company_id: None,
            back_reference_field: default_back_reference_field(),
            legacy_id_field: None,
            order: None,
        }
    }
}

/// A mapping table filled by natural-key matching before migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedConfig {
    pub entity_type: String,
    pub key_field: String,
}

const fn default_port() -> u16 {
    8069
}

const fn default_timeout_secs() -> u64 {
    60
}

const fn default_page_size() -> usize {
    100
}

fn default_mappings_dir() -> PathBuf {
    PathBuf::from("mappings")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_language() -> String {
    "en_US".to_string()
}

fn default_back_reference_field() -> String {
    "new_id".to_string()
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// A parsed config and the file it came from (`None` for built-in defaults).
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: FerryConfig,
    pub path: Option<PathBuf>,
}

/// Locate and parse the configuration.
///
/// Lookup order: `explicit` (must exist), `./ferry.toml`, then
/// `<config dir>/ferry/ferry.toml`. Without any file the defaults are used.
/// Password environment variables are applied and the result is validated.
///
/// # Errors
///
/// Returns an error if a file cannot be read or parsed, or fails validation.
pub fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => discover_config_file(),
    };

    let mut config = match &path {
        Some(path) => parse_config_file(path)?,
        None => FerryConfig::default(),
    };
    config.apply_env_overrides(|name| std::env::var(name).ok());
    config.validate().with_context(|| match &path {
        Some(path) => format!("Invalid configuration in {}", path.display()),
        None => "Invalid default configuration".to_string(),
    })?;

    Ok(LoadedConfig { config, path })
}

fn discover_config_file() -> Option<PathBuf> {
    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.exists() {
        return Some(local);
    }
    dirs::config_dir()
        .map(|dir| dir.join("ferry").join(CONFIG_FILE_NAME))
        .filter(|path| path.exists())
}

/// Parse one config file without env overrides or validation.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not valid TOML for
/// [`FerryConfig`].
pub fn parse_config_file(path: &Path) -> Result<FerryConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str::<FerryConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

impl FerryConfig {
    /// Replace passwords with values from `lookup` when it has them.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let (Some(endpoint), Some(password)) = (&mut self.source, lookup(SOURCE_PASSWORD_ENV)) {
            endpoint.password = password;
        }
        if let (Some(endpoint), Some(password)) =
            (&mut self.destination, lookup(DESTINATION_PASSWORD_ENV))
        {
            endpoint.password = password;
        }
    }

    /// Check values that would otherwise fail mid-run.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError::Invalid`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let settings = &self.settings;
        if settings.page_size == 0 {
            return Err(ConfigError::invalid("settings.page_size", "must be at least 1"));
        }
        if settings.back_reference_field.trim().is_empty() {
            return Err(ConfigError::invalid(
                "settings.back_reference_field",
                "must not be empty",
            ));
        }
        if settings
            .legacy_id_field
            .as_deref()
            .is_some_and(|field| field.trim().is_empty())
        {
            return Err(ConfigError::invalid(
                "settings.legacy_id_field",
                "must not be empty when set",
            ));
        }
        for name in settings.order.iter().flatten() {
            check_entity_name("settings.order", name)?;
        }

        for (key, endpoint) in [("source", &self.source), ("destination", &self.destination)] {
            let Some(endpoint) = endpoint else {
                continue;
            };
            if endpoint.host.trim().is_empty() {
                return Err(ConfigError::invalid(format!("{key}.host"), "must not be empty"));
            }
            if endpoint.database.trim().is_empty() {
                return Err(ConfigError::invalid(
                    format!("{key}.database"),
                    "must not be empty",
                ));
            }
        }

        for seed in &self.seed {
            check_entity_name("seed.entity_type", &seed.entity_type)?;
            if seed.key_field.trim().is_empty() {
                return Err(ConfigError::invalid(
                    "seed.key_field",
                    format!("empty key field for {}", seed.entity_type),
                ));
            }
        }

        for spec in &self.entities {
            check_entity_name("entities.name", &spec.name)?;
            if spec.natural_key.is_empty() {
                return Err(ConfigError::invalid(
                    "entities.natural_key",
                    format!("{} needs at least one natural key field", spec.name),
                ));
            }
        }

        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when `[source]` is missing.
    pub fn source(&self) -> Result<&EndpointConfig, ConfigError> {
        self.source
            .as_ref()
            .ok_or_else(|| ConfigError::invalid("source", "section is missing"))
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when `[destination]` is missing.
    pub fn destination(&self) -> Result<&EndpointConfig, ConfigError> {
        self.destination
            .as_ref()
            .ok_or_else(|| ConfigError::invalid("destination", "section is missing"))
    }

    #[must_use]
    pub fn handler_settings(&self) -> HandlerSettings {
        HandlerSettings {
            company_id: self.settings.company_id,
            legacy_id_field: self.settings.legacy_id_field.clone(),
        }
    }

    /// Built-in handlers plus `[[entities]]`, which replace built-ins of the
    /// same name.
    #[must_use]
    pub fn registry(&self) -> HandlerRegistry {
        let mut registry = HandlerRegistry::with_defaults(self.handler_settings());
        for spec in &self.entities {
            registry.register_spec(spec.clone());
        }
        registry
    }

    /// Entity types to migrate, before dependency ordering.
    #[must_use]
    pub fn requested_order(&self) -> Vec<String> {
        self.settings.order.clone().unwrap_or_else(|| {
            DEFAULT_ORDER.iter().map(|name| (*name).to_string()).collect()
        })
    }

    #[must_use]
    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            page_size: self.settings.page_size,
            back_reference_field: self.settings.back_reference_field.clone(),
            ..PipelineOptions::default()
        }
    }

    /// Copy safe to print: passwords replaced.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for endpoint in [&mut copy.source, &mut copy.destination].into_iter().flatten() {
            if !endpoint.password.is_empty() {
                endpoint.password = REDACTED.to_string();
            }
        }
        copy
    }
}

fn check_entity_name(key: &str, name: &str) -> Result<(), ConfigError> {
    if is_valid_entity_type(name) {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            key,
            format!("'{name}' is not a usable entity type name"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::EntityHandler;
    use tempfile::TempDir;

    const FULL: &str = r#"
[source]
host = "old.example.com"
database = "odoo11"
username = "admin"
password = "secret"

[destination]
host = "new.example.com"
port = 443
https = true
database = "odoo16"
username = "admin"

[settings]
page_size = 50
mappings_dir = "state/maps"
company_id = 2
legacy_id_field = "old_id"
order = ["res.groups", "res.country.state"]

[[seed]]
entity_type = "res.country"
key_field = "code"

[[entities]]
name = "res.country.state"
natural_key = ["code", "country_id"]
update_fields = ["name"]

[[entities.fields]]
kind = "copy"
source = "name"
dest = "name"

[[entities.fields]]
kind = "reference"
source = "country_id"
dest = "country_id"
target = "res.country"
"#;

    fn parse(text: &str) -> FerryConfig {
        toml::from_str(text).expect("parse config")
    }

    #[test]
    fn defaults_apply_to_empty_file() {
        let config = parse("");
        assert_eq!(config.settings.page_size, 100);
        assert_eq!(config.settings.mappings_dir, PathBuf::from("mappings"));
        assert_eq!(config.settings.back_reference_field, "new_id");
        assert_eq!(config.settings.language, "en_US");
        assert!(config.source.is_none());
        assert_eq!(config.requested_order().len(), DEFAULT_ORDER.len());
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn full_file_parses() {
        let config = parse(FULL);
        let source = config.source().expect("source");
        assert_eq!(source.port, 8069);
        assert_eq!(source.url(), "http://old.example.com:8069");
        let destination = config.destination().expect("destination");
        assert_eq!(destination.url(), "https://new.example.com:443");
        assert_eq!(destination.password, "");
        assert_eq!(destination.timeout_secs, 60);

        assert_eq!(config.seed.len(), 1);
        assert_eq!(config.entities[0].fields.len(), 2);
        assert_eq!(config.requested_order(), vec!["res.groups", "res.country.state"]);
        assert_eq!(config.pipeline_options().page_size, 50);
        config.validate().expect("valid");
    }

    #[test]
    fn declared_entities_join_the_registry() {
        let config = parse(FULL);
        let registry = config.registry();
        let handler = registry.build("res.country.state").expect("declared handler");
        assert_eq!(handler.dependencies(), vec!["res.country".to_string()]);
        assert!(registry.contains("res.users"));
        assert_eq!(registry.settings().company_id, Some(2));
    }

    #[test]
    fn env_overrides_passwords() {
        let mut config = parse(FULL);
        config.apply_env_overrides(|name| {
            (name == DESTINATION_PASSWORD_ENV).then(|| "from-env".to_string())
        });
        assert_eq!(config.destination().expect("dest").password, "from-env");
        assert_eq!(config.source().expect("source").password, "secret");
    }

    #[test]
    fn redacted_hides_passwords() {
        let config = parse(FULL).redacted();
        assert_eq!(config.source().expect("source").password, REDACTED);
        // Empty passwords stay empty so a missing secret is visible.
        assert_eq!(config.destination().expect("dest").password, "");
        let debug = format!("{:?}", parse(FULL).source);
        assert!(!debug.contains("secret"));
    }

    #[test]
    fn zero_page_size_is_rejected() {
        let config = parse("[settings]\npage_size = 0\n");
        let err = config.validate().expect_err("invalid");
        assert_eq!(err.code(), crate::error::ErrorCode::ConfigInvalid);
        assert!(err.to_string().contains("settings.page_size"));
    }

    #[test]
    fn unusable_entity_names_are_rejected() {
        let config = parse("[settings]\norder = [\"../escape\"]\n");
        assert!(config.validate().is_err());

        let config = parse("[[seed]]\nentity_type = \"res.groups\"\nkey_field = \"\"\n");
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_sections_are_reported() {
        let config = parse("");
        let err = config.source().expect_err("no source");
        assert!(err.to_string().contains("source"));
    }

    #[test]
    fn load_config_reads_explicit_path() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, FULL).expect("write config");

        let loaded = load_config(Some(&path)).expect("load");
        assert_eq!(loaded.path.as_deref(), Some(path.as_path()));
        assert_eq!(loaded.config.settings.page_size, 50);
    }

    #[test]
    fn load_config_reports_parse_errors_with_path() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[settings\n").expect("write config");

        let err = load_config(Some(&path)).expect_err("broken");
        assert!(format!("{err:#}").contains("broken.toml"));
    }
}
