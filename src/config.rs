use anyhow::{bail, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub endpoints: Vec<String>,
    pub alert_path: String,
    pub hold_duration_ms: u64,
    pub location_timeout_ms: u64,
    pub location_target_accuracy_m: f64,
    pub location_max_samples: u32,
    pub attempt_timeout_ms: u64,
    pub sticky_endpoint: bool,
    pub share_location_default: bool,
    pub retry_interval_secs: u64,
    pub retry_max_backoff_secs: u64,
    pub db_path: String,
    pub fallback_path: String,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://localhost:5000".to_string()],
            alert_path: "/api/send_alert".to_string(),
            hold_duration_ms: 1200,
            location_timeout_ms: 9000,
            location_target_accuracy_m: 5.0,
            location_max_samples: 8,
            attempt_timeout_ms: 5000,
            sticky_endpoint: true,
            share_location_default: false,
            retry_interval_secs: 30,
            retry_max_backoff_secs: 300,
            db_path: "panic-alert.db".to_string(),
            fallback_path: "panic-alert-pending.jsonl".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        dotenv().ok();

        let defaults = Self::default();

        let endpoints = match env::var("ALERT_ENDPOINTS") {
            Ok(raw) => parse_endpoints(&raw),
            Err(_) => defaults.endpoints.clone(),
        };
        if endpoints.is_empty() {
            bail!("ALERT_ENDPOINTS must list at least one base URL");
        }

        let alert_path = env::var("ALERT_PATH").unwrap_or(defaults.alert_path);
        let db_path = env::var("ALERT_DB_PATH").unwrap_or(defaults.db_path);
        let fallback_path = env::var("ALERT_FALLBACK_PATH").unwrap_or(defaults.fallback_path);
        let log_level = env::var("LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            endpoints,
            alert_path,
            hold_duration_ms: parsed("HOLD_DURATION_MS", defaults.hold_duration_ms),
            location_timeout_ms: parsed("LOCATION_TIMEOUT_MS", defaults.location_timeout_ms),
            location_target_accuracy_m: parsed(
                "LOCATION_TARGET_ACCURACY_M",
                defaults.location_target_accuracy_m,
            ),
            location_max_samples: parsed("LOCATION_MAX_SAMPLES", defaults.location_max_samples),
            attempt_timeout_ms: parsed("ATTEMPT_TIMEOUT_MS", defaults.attempt_timeout_ms),
            sticky_endpoint: parsed("STICKY_ENDPOINT", defaults.sticky_endpoint),
            share_location_default: parsed(
                "SHARE_LOCATION_DEFAULT",
                defaults.share_location_default,
            ),
            retry_interval_secs: parsed("RETRY_INTERVAL_SECS", defaults.retry_interval_secs),
            retry_max_backoff_secs: parsed(
                "RETRY_MAX_BACKOFF_SECS",
                defaults.retry_max_backoff_secs,
            ),
            db_path,
            fallback_path,
            log_level,
        })
    }

    pub fn hold_duration(&self) -> Duration {
        Duration::from_millis(self.hold_duration_ms)
    }

    pub fn location_timeout(&self) -> Duration {
        Duration::from_millis(self.location_timeout_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn retry_max_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_max_backoff_secs)
    }
}

fn parsed<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_endpoints(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().trim_end_matches('/'))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
