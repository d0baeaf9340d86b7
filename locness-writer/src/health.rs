//! `health`: static readiness report for deployment platforms.
//!
//! Checks configuration and credential presence only; no network calls.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

use locness_writer_core::config::Config;

use crate::credentials::{ServiceAccountKey, CREDENTIALS_FILE_ENV, CREDENTIALS_JSON_ENV};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Configured,
    MissingCredentials,
    CredentialsFileMissing,
    InvalidCredentials,
}

#[derive(Debug, Serialize)]
pub struct Environment {
    pub aws_region: String,
    pub dynamodb_table: String,
    pub google_drive_folder: String,
    pub csv_name_prefix: String,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub version: &'static str,
    pub environment: Environment,
    pub services: BTreeMap<&'static str, ServiceStatus>,
}

fn not_set(value: Option<&str>) -> String {
    match value {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => "not_set".to_string(),
    }
}

fn aws_status<F: Fn(&str) -> Option<String>>(lookup: &F) -> ServiceStatus {
    let keys = lookup("AWS_ACCESS_KEY_ID").is_some() && lookup("AWS_SECRET_ACCESS_KEY").is_some();
    let profile = lookup("AWS_PROFILE").is_some() || lookup("AWS_WEB_IDENTITY_TOKEN_FILE").is_some();
    if keys || profile {
        ServiceStatus::Configured
    } else {
        ServiceStatus::MissingCredentials
    }
}

fn google_status<F: Fn(&str) -> Option<String>>(lookup: &F) -> ServiceStatus {
    if let Some(json) = lookup(CREDENTIALS_JSON_ENV) {
        return match ServiceAccountKey::from_json(&json) {
            Ok(_) => ServiceStatus::Configured,
            Err(_) => ServiceStatus::InvalidCredentials,
        };
    }
    match lookup(CREDENTIALS_FILE_ENV) {
        Some(path) if Path::new(&path).exists() => ServiceStatus::Configured,
        Some(_) => ServiceStatus::CredentialsFileMissing,
        None => ServiceStatus::MissingCredentials,
    }
}

/// Builds the report. `lookup` reads environment variables; empty values count
/// as unset.
pub fn health_check<F>(config: &Config, lookup: F, now: DateTime<Utc>) -> HealthReport
where
    F: Fn(&str) -> Option<String>,
{
    let lookup = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    let mut services = BTreeMap::new();
    services.insert("aws", aws_status(&lookup));
    services.insert("google_drive", google_status(&lookup));

    let mut status = if services.values().all(|s| *s == ServiceStatus::Configured) {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    };
    if config.validate().is_err() {
        status = HealthStatus::Degraded;
    }

    HealthReport {
        status,
        timestamp: now,
        version: env!("CARGO_PKG_VERSION"),
        environment: Environment {
            aws_region: not_set(config.store.region.as_deref()),
            dynamodb_table: not_set(Some(config.store.table_name.as_str())),
            google_drive_folder: not_set(config.publish.folder_id.as_deref()),
            csv_name_prefix: config.publish.prefix.clone(),
        },
        services,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn configured() -> Config {
        let mut config = Config::default();
        config.store.table_name = "sensor-readings".to_string();
        config
    }

    #[test]
    fn healthy_when_everything_is_present() {
        let json = r#"{"type":"service_account","client_email":"a@b","private_key":"k"}"#;
        let report = health_check(
            &configured(),
            env(&[
                ("AWS_ACCESS_KEY_ID", "AKIA"),
                ("AWS_SECRET_ACCESS_KEY", "secret"),
                ("GOOGLE_CREDENTIALS_JSON", json),
            ]),
            Utc::now(),
        );
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.services["google_drive"], ServiceStatus::Configured);
    }

    #[test]
    fn degraded_when_credentials_file_is_missing() {
        let report = health_check(
            &configured(),
            env(&[
                ("AWS_ACCESS_KEY_ID", "AKIA"),
                ("AWS_SECRET_ACCESS_KEY", "secret"),
                ("GOOGLE_CREDENTIALS_FILE", "/nonexistent/credentials.json"),
            ]),
            Utc::now(),
        );
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(
            report.services["google_drive"],
            ServiceStatus::CredentialsFileMissing
        );
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["services"]["google_drive"], "credentials_file_missing");
        assert_eq!(json["status"], "degraded");
    }

    #[test]
    fn missing_table_degrades_and_shows_not_set() {
        let report = health_check(&Config::default(), env(&[]), Utc::now());
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.environment.dynamodb_table, "not_set");
        assert_eq!(report.services["aws"], ServiceStatus::MissingCredentials);
    }
}
