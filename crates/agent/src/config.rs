//! Service configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming an optional config file
pub const CONFIG_FILE_ENV: &str = "NETSENTRY_CONFIG";

/// Daemon configuration, from `NETSENTRY_*` variables layered over an
/// optional file
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Directory of agent configs (`*.yaml`, `*.yml`, `*.json`)
    #[serde(default = "default_agents_dir")]
    pub agents_dir: PathBuf,

    #[serde(default = "default_model_store_dir")]
    pub model_store_dir: PathBuf,

    /// Directory of `*.jsonl` device logs
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// JSON-lines file anomalies are appended to
    #[serde(default = "default_anomaly_output")]
    pub anomaly_output: PathBuf,

    /// Driver tick in seconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// How long shutdown waits for in-flight cycles
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_service_name() -> String {
    "netsentry".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_agents_dir() -> PathBuf {
    PathBuf::from("/etc/netsentry/agents")
}

fn default_model_store_dir() -> PathBuf {
    PathBuf::from("/var/lib/netsentry/models")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/netsentry/devices")
}

fn default_anomaly_output() -> PathBuf {
    PathBuf::from("/var/lib/netsentry/anomalies.jsonl")
}

fn default_tick_interval() -> u64 {
    5
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            api_port: default_api_port(),
            agents_dir: default_agents_dir(),
            model_store_dir: default_model_store_dir(),
            log_dir: default_log_dir(),
            anomaly_output: default_anomaly_output(),
            tick_interval_secs: default_tick_interval(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl ServiceConfig {
    /// Load from the file named by `NETSENTRY_CONFIG` (if set) and the
    /// environment; environment wins
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_FILE_ENV).ok().map(PathBuf::from);
        Self::load_from(file.as_deref())
    }

    pub fn load_from(file: Option<&std::path::Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("NETSENTRY").try_parsing(true))
            .build()
            .context("failed to assemble service config")?;

        let parsed: Self = config
            .try_deserialize()
            .context("invalid service config")?;
        if parsed.tick_interval_secs == 0 {
            anyhow::bail!("tick_interval_secs must be at least 1");
        }
        Ok(parsed)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_file_values_override_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "api_port: 9100\ntick_interval_secs: 2\nlog_dir: /tmp/logs").unwrap();

        let config = ServiceConfig::load_from(Some(file.path())).unwrap();
        assert_eq!(config.api_port, 9100);
        assert_eq!(config.tick_interval(), Duration::from_secs(2));
        assert_eq!(config.log_dir, PathBuf::from("/tmp/logs"));
        assert_eq!(config.shutdown_timeout_secs, 30);
    }

    #[test]
    fn test_zero_tick_rejected() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "tick_interval_secs: 0").unwrap();

        assert!(ServiceConfig::load_from(Some(file.path())).is_err());
    }
}
