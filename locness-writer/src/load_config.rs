/// `load_config` module: loads the optional static YAML config and layers
/// deployment overrides from the environment on top of it.
///
/// # Responsibilities
/// - Parse the YAML file (no secrets) into the core [`Config`] model
/// - Apply environment overrides (`DYNAMODB_TABLE_NAME`, `AWS_REGION`, ...)
/// - Surface every failure as a clear `anyhow` error for the CLI boundary
///
/// Secrets (AWS keys, Google credentials) are never read here; the store and
/// publisher pick them up directly from the environment.
use anyhow::{Context, Result};
use locness_writer_core::config::Config;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Environment variables that override YAML settings.
pub const ENV_OVERRIDES: &[&str] = &[
    "DYNAMODB_TABLE_NAME",
    "AWS_REGION",
    "CSV_NAME_PREFIX",
    "GOOGLE_DRIVE_FOLDER_ID",
    "GOOGLE_SHARED_DRIVE_ID",
    "POLL_INTERVAL_SECS",
    "WATERMARK_STATE_FILE",
];

/// Applies overrides from `lookup` (normally the process environment). Empty
/// values are ignored.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    if let Some(table) = get("DYNAMODB_TABLE_NAME") {
        config.store.table_name = table;
    }
    if let Some(region) = get("AWS_REGION") {
        config.store.region = Some(region);
    }
    if let Some(prefix) = get("CSV_NAME_PREFIX") {
        config.publish.prefix = prefix;
    }
    if let Some(folder) = get("GOOGLE_DRIVE_FOLDER_ID") {
        config.publish.folder_id = Some(folder);
    }
    if let Some(drive) = get("GOOGLE_SHARED_DRIVE_ID") {
        config.publish.shared_drive_id = Some(drive);
    }
    if let Some(secs) = get("POLL_INTERVAL_SECS") {
        config.schedule.interval_secs = secs
            .trim()
            .parse()
            .with_context(|| format!("POLL_INTERVAL_SECS must be a whole number of seconds, got '{secs}'"))?;
    }
    if let Some(path) = get("WATERMARK_STATE_FILE") {
        config.watermark.state_file = Some(PathBuf::from(path));
    }
    Ok(())
}

/// Loads the YAML config at `path` (or defaults when `None`) and applies
/// environment overrides. Does not validate.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path_ref) => {
            info!(config_path = ?path_ref, "Loading configuration from file");
            let content = fs::read_to_string(path_ref).map_err(|e| {
                error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
                anyhow::anyhow!("Failed to read config file {:?}: {}", path_ref, e)
            })?;
            if content.trim().is_empty() {
                Config::default()
            } else {
                serde_yaml::from_str::<Config>(&content).map_err(|e| {
                    error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
                    anyhow::anyhow!("Failed to parse config YAML: {e}")
                })?
            }
        }
        None => {
            info!("No config file given, using defaults and environment");
            Config::default()
        }
    };

    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    Ok(config)
}

/// [`load_config`] followed by validation; what the pipeline commands use.
pub fn load_valid_config(path: Option<&Path>) -> Result<Config> {
    let config = load_config(path)?;
    config.validate().map_err(|e| {
        error!(error = %e, "Invalid configuration");
        anyhow::anyhow!("Invalid configuration: {e}")
    })?;
    config.trace_loaded();
    Ok(config)
}
