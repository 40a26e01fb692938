//! Application configuration for GeoHarvest.
//!
//! User config lives at `~/.geoharvest/geoharvest.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "geoharvest.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".geoharvest";

/// Environment switch that re-raises object-level errors.
pub const DEBUG_ENV_VAR: &str = "GEOHARVEST_DEBUG";

// ---------------------------------------------------------------------------
// Config structs (matching geoharvest.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Schema validation settings.
    #[serde(default)]
    pub validation: ValidationConfig,

    /// Harvest job behaviour.
    #[serde(default)]
    pub harvest: HarvestDefaults,

    /// Database location.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// `[validation]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Named schema profiles each document is checked against.
    #[serde(default = "default_profiles")]
    pub profiles: Vec<String>,

    /// Abort the import of documents that fail validation.
    #[serde(default)]
    pub reject: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            profiles: default_profiles(),
            reject: false,
        }
    }
}

fn default_profiles() -> Vec<String> {
    vec!["iso19139".into(), "gemini2".into()]
}

/// `[harvest]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestDefaults {
    /// Re-import documents even when their metadata date is unchanged.
    #[serde(default)]
    pub force_import: bool,

    /// Identifiers requested per catalog page.
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Timeout for every remote request, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Concurrent retrievals in the fetch stage.
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: u32,

    /// Re-raise object-level errors instead of recording them.
    #[serde(default)]
    pub debug_exceptions: bool,

    /// Numeric suffixes tried before a name is declared exhausted.
    #[serde(default = "default_max_name_attempts")]
    pub max_name_attempts: u32,
}

impl Default for HarvestDefaults {
    fn default() -> Self {
        Self {
            force_import: false,
            page_size: default_page_size(),
            timeout_secs: default_timeout(),
            fetch_concurrency: default_fetch_concurrency(),
            debug_exceptions: false,
            max_name_attempts: default_max_name_attempts(),
        }
    }
}

fn default_page_size() -> u32 {
    10
}
fn default_timeout() -> u64 {
    30
}
fn default_fetch_concurrency() -> u32 {
    4
}
fn default_max_name_attempts() -> u32 {
    100
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the libSQL database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.geoharvest/geoharvest.db".into()
}

// ---------------------------------------------------------------------------
// Harvest config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime harvest configuration: merged from config file, env and CLI flags.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    /// Validation profile names.
    pub profiles: Vec<String>,
    /// Abort invalid documents instead of warning.
    pub reject_invalid: bool,
    /// Re-import regardless of metadata dates.
    pub force_import: bool,
    /// Identifiers per catalog page.
    pub page_size: u32,
    /// Remote request timeout in seconds.
    pub timeout_secs: u64,
    /// Concurrent retrievals in the fetch stage.
    pub fetch_concurrency: u32,
    /// Re-raise object-level errors.
    pub debug_exceptions: bool,
    /// Slug suffix attempts.
    pub max_name_attempts: u32,
}

impl From<&AppConfig> for HarvestConfig {
    fn from(config: &AppConfig) -> Self {
        let debug_env = std::env::var(DEBUG_ENV_VAR)
            .map(|v| !v.is_empty() && v != "0")
            .unwrap_or(false);

        Self {
            profiles: config.validation.profiles.clone(),
            reject_invalid: config.validation.reject,
            force_import: config.harvest.force_import,
            page_size: config.harvest.page_size.max(1),
            timeout_secs: config.harvest.timeout_secs,
            fetch_concurrency: config.harvest.fetch_concurrency.max(1),
            debug_exceptions: config.harvest.debug_exceptions || debug_env,
            max_name_attempts: config.harvest.max_name_attempts,
        }
    }
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Per-source config (stored as JSON with each harvest source)
// ---------------------------------------------------------------------------

/// Options attached to a single harvest source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// CQL filter passed to the catalog's record query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cql: Option<String>,
    /// Sort key passed to the catalog's record query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<String>,
    /// Treat the source URL as one static catalog response, no paging.
    #[serde(default)]
    pub static_xml: bool,
    /// Group every harvested record under this publisher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher_id: Option<String>,
    /// Force re-import for this source only.
    #[serde(default)]
    pub force_import: bool,
}

impl SourceConfig {
    /// Parse the JSON blob stored with a source. Empty input means defaults.
    pub fn from_json(raw: Option<&str>) -> Result<Self> {
        match raw.map(str::trim) {
            None | Some("") => Ok(Self::default()),
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| HarvestError::config(format!("invalid source config: {e}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.geoharvest/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| HarvestError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.geoharvest/geoharvest.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| HarvestError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| HarvestError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| HarvestError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| HarvestError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| HarvestError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` in a configured path.
pub fn resolve_path(raw: &str) -> Result<PathBuf> {
    match raw.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| HarvestError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(raw)),
    }
}
