//! Static configuration model. Parsed from YAML by the CLI, which layers
//! environment overrides on top; secrets never live here.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use crate::fetch::FetchSettings;
use crate::record::RecordSchema;
use crate::synchronise::SyncSettings;
use crate::watermark::StartPosition;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub fetch: FetchSettings,
    pub publish: PublishConfig,
    pub schedule: ScheduleConfig,
    pub watermark: WatermarkConfig,
}

/// Key-value store access. Only the table name is mandatory.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub table_name: String,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub timestamp_field: String,
    /// `strftime` pattern used to render range bounds for store-side comparison.
    pub timestamp_format: String,
    pub record_key: Vec<String>,
    /// Range query setup. `None` means every fetch scans.
    pub query: Option<QueryConfig>,
    pub timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            table_name: String::new(),
            region: None,
            endpoint_url: None,
            timestamp_field: "datetime_utc".to_string(),
            timestamp_format: "%Y-%m-%dT%H:%M:%SZ".to_string(),
            record_key: vec!["data".to_string(), "datetime_utc".to_string()],
            query: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueryConfig {
    pub partition_key: String,
    pub partition_value: String,
    #[serde(default)]
    pub index_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub prefix: String,
    pub folder_id: Option<String>,
    pub shared_drive_id: Option<String>,
    pub late_window_hours: i64,
    pub timeout_secs: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            prefix: "locness_data".to_string(),
            folder_id: None,
            shared_drive_id: None,
            late_window_hours: 2,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatermarkConfig {
    /// `earliest`, `lookback:<minutes>` or an RFC 3339 instant.
    pub start: String,
    pub state_file: Option<PathBuf>,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            start: "lookback:60".to_string(),
            state_file: None,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid setting {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

impl Config {
    /// Checks every constraint that does not need network access.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, message: &str| ConfigError::Invalid {
            field,
            message: message.to_string(),
        };
        if self.store.table_name.trim().is_empty() {
            return Err(ConfigError::Missing("store.table_name"));
        }
        if self.store.timestamp_field.trim().is_empty() {
            return Err(invalid("store.timestamp_field", "must not be empty"));
        }
        if self.fetch.page_size == 0 {
            return Err(invalid("fetch.page_size", "must be at least 1"));
        }
        if self.fetch.max_pages == 0 {
            return Err(invalid("fetch.max_pages", "must be at least 1"));
        }
        if self.fetch.retry.max_attempts == 0 {
            return Err(invalid("fetch.retry.max_attempts", "must be at least 1"));
        }
        if self.publish.prefix.trim().is_empty() {
            return Err(invalid("publish.prefix", "must not be empty"));
        }
        if self.publish.late_window_hours < 0 {
            return Err(invalid("publish.late_window_hours", "must not be negative"));
        }
        if self.schedule.interval_secs == 0 {
            return Err(invalid("schedule.interval_secs", "must be at least 1"));
        }
        self.start_position()?;
        Ok(())
    }

    pub fn start_position(&self) -> Result<StartPosition, ConfigError> {
        self.watermark
            .start
            .parse()
            .map_err(|message| ConfigError::Invalid {
                field: "watermark.start",
                message,
            })
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.schedule.interval_secs)
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            schema: RecordSchema {
                timestamp_field: self.store.timestamp_field.clone(),
                key_fields: self.store.record_key.clone(),
            },
            fetch: self.fetch.clone(),
            prefix: self.publish.prefix.clone(),
            late_window_hours: self.publish.late_window_hours,
        }
    }

    pub fn trace_loaded(&self) {
        info!(
            table = %self.store.table_name,
            region = self.store.region.as_deref().unwrap_or("default"),
            indexed = self.store.query.is_some(),
            prefix = %self.publish.prefix,
            interval_secs = self.schedule.interval_secs,
            start = %self.watermark.start,
            "Loaded Config"
        );
        debug!(?self, "Config loaded (full debug)");
    }
}
