//! Configuration management for the transaction monitor
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "TWOPC_MONITOR_CONFIG";

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// SSE endpoint of the coordinator
    pub coordinator_url: String,
    #[serde(default = "default_coordinator_name")]
    pub coordinator_name: String,
    /// Deadline tracker granularity
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Reconnect delay used until the server sends a `retry:` field
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Regex with one capture group extracting the participant number from its service url
    #[serde(default = "default_participant_url_pattern")]
    pub participant_url_pattern: String,
    /// Participant SSE endpoint, `{n}` is replaced by the captured number
    #[serde(default = "default_participant_endpoint_template")]
    pub participant_endpoint_template: String,
    #[serde(default = "default_participant_name_template")]
    pub participant_name_template: String,
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
}

fn default_coordinator_name() -> String {
    "Controller".to_string()
}

fn default_tick_interval_ms() -> u64 {
    200
}

fn default_retry_delay_ms() -> u64 {
    3000
}

fn default_participant_url_pattern() -> String {
    r"localhost:501([0-9])".to_string()
}

fn default_participant_endpoint_template() -> String {
    "http://localhost:901{n}/debug_sse".to_string()
}

fn default_participant_name_template() -> String {
    "Service #{n}".to_string()
}

fn default_notification_capacity() -> usize {
    1024
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9100,
        }
    }
}

impl MonitorConfig {
    /// Config pointing at a coordinator url with every other field defaulted
    pub fn for_coordinator(coordinator_url: impl Into<String>) -> Self {
        Self {
            coordinator_url: coordinator_url.into(),
            coordinator_name: default_coordinator_name(),
            tick_interval_ms: default_tick_interval_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            participant_url_pattern: default_participant_url_pattern(),
            participant_endpoint_template: default_participant_endpoint_template(),
            participant_name_template: default_participant_name_template(),
            notification_capacity: default_notification_capacity(),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Settings {
    /// Load settings from the file named by `TWOPC_MONITOR_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::parse(&config_str)
    }

    /// Parse settings from TOML text
    pub fn parse(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        let monitor = &self.monitor;

        if monitor.coordinator_url.trim().is_empty() {
            anyhow::bail!("monitor.coordinator_url must be set");
        }
        if monitor.tick_interval_ms == 0 {
            anyhow::bail!("monitor.tick_interval_ms must be greater than zero");
        }
        if monitor.notification_capacity == 0 {
            anyhow::bail!("monitor.notification_capacity must be greater than zero");
        }

        let pattern = Regex::new(&monitor.participant_url_pattern)
            .with_context(|| "Invalid monitor.participant_url_pattern")?;
        if pattern.captures_len() < 2 {
            anyhow::bail!("monitor.participant_url_pattern needs a capture group");
        }
        if !monitor.participant_endpoint_template.contains("{n}") {
            anyhow::bail!("monitor.participant_endpoint_template must contain {{n}}");
        }
        if !self.api.enabled && !self.metrics.enabled {
            tracing::warn!("API and metrics are both disabled - state is only visible in logs");
        }

        Ok(())
    }
}

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR
        .replace_all(input, |cap: &regex::Captures| {
            env::var(&cap[1]).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
        [monitor]
        coordinator_url = "http://localhost:9000/debug_sse"
    "#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TWOPC_TEST_HOST", "monitor.internal");
        let input = "url = \"http://${TWOPC_TEST_HOST}:9000/debug_sse\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"http://monitor.internal:9000/debug_sse\"");
    }

    #[test]
    fn test_missing_env_var_becomes_empty() {
        let result = substitute_env_vars("a${TWOPC_TEST_DEFINITELY_UNSET}b");
        assert_eq!(result, "ab");
    }

    #[test]
    fn test_defaults_applied() {
        let settings = tokio_test::assert_ok!(Settings::parse(MINIMAL));
        assert_eq!(settings.monitor.coordinator_name, "Controller");
        assert_eq!(settings.monitor.tick_interval(), Duration::from_millis(200));
        assert_eq!(settings.monitor.retry_delay_ms, 3000);
        assert_eq!(
            settings.monitor.participant_endpoint_template,
            "http://localhost:901{n}/debug_sse"
        );
        assert!(settings.api.enabled);
        assert!(!settings.metrics.enabled);
        assert!(!settings.logging.json);
    }

    #[test]
    fn test_rejects_zero_tick() {
        let input = r#"
            [monitor]
            coordinator_url = "http://localhost:9000/debug_sse"
            tick_interval_ms = 0
        "#;
        assert!(Settings::parse(input).is_err());
    }

    #[test]
    fn test_rejects_pattern_without_group() {
        let input = r#"
            [monitor]
            coordinator_url = "http://localhost:9000/debug_sse"
            participant_url_pattern = "localhost:501[0-9]"
        "#;
        let err = Settings::parse(input).unwrap_err();
        assert!(err.to_string().contains("capture group"));
    }

    #[test]
    fn test_rejects_template_without_placeholder() {
        let input = r#"
            [monitor]
            coordinator_url = "http://localhost:9000/debug_sse"
            participant_endpoint_template = "http://localhost:9011/debug_sse"
        "#;
        assert!(Settings::parse(input).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "{}\n[api]\nenabled = false\nhost = \"0.0.0.0\"\nport = 9999\n\n[metrics]\nenabled = true\nport = 9101",
            MINIMAL
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert!(!settings.api.enabled);
        assert_eq!(settings.api.port, 9999);
        assert!(settings.metrics.enabled);
        assert_eq!(settings.metrics.port, 9101);
    }
}
