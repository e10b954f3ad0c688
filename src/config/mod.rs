use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

pub use crate::leader::LeaderConfig;
pub use crate::nats::NatsConfig;
pub use crate::retry::Backoff;
pub use crate::secrets::SecretsConfig;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "EVENTGATE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "eventgate.toml";

/// Process-level configuration shared by every event source runner
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub nats: NatsConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub leader: LeaderConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
}

impl GatewayConfig {
    /// Checks values serde accepts but the runtime cannot use.
    pub fn validate(&self) -> Result<()> {
        self.supervisor
            .connector_backoff
            .validate()
            .context("invalid [supervisor.connector_backoff]")
    }
}

/// Listener supervisor configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// How often the reconnect daemon checks the bus connection
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_seconds: u64,
    /// Retry policy applied to each connector's listen loop
    #[serde(default = "Backoff::connector")]
    pub connector_backoff: Backoff,
}

fn default_reconnect_interval() -> u64 {
    5
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_seconds: default_reconnect_interval(),
            connector_backoff: Backoff::connector(),
        }
    }
}

impl SupervisorConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_seconds.max(1))
    }
}

/// Path of the configuration file, from `EVENTGATE_CONFIG` or the default.
pub fn config_path() -> String {
    std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
}

/// Load configuration from TOML file
pub fn load_config<T: DeserializeOwned>(path: &str) -> Result<T> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    parse_config(&contents).with_context(|| format!("Failed to parse config file {}", path))
}

/// Parse configuration from a TOML string
pub fn parse_config<T: DeserializeOwned>(contents: &str) -> Result<T> {
    Ok(toml::from_str(contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.nats.stream_name, "EVENTGATE");
        assert_eq!(config.supervisor.reconnect_interval_seconds, 5);
        assert_eq!(config.supervisor.connector_backoff, Backoff::connector());
        assert_eq!(config.leader.lease_ttl_seconds, 15);
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [nats]
            url = "nats://example.com:4222"
            stream_name = "TEST_STREAM"

            [supervisor]
            reconnect_interval_seconds = 2

            [supervisor.connector_backoff]
            duration_ms = 250
            factor = 2.0
            jitter = 0.1
            steps = 3

            [leader]
            lease_ttl_seconds = 30

            [secrets]
            root = "/run/secrets"
        "#;

        let config: GatewayConfig = parse_config(toml).unwrap();
        assert_eq!(config.nats.url, "nats://example.com:4222");
        assert_eq!(config.nats.stream_name, "TEST_STREAM");
        assert_eq!(config.supervisor.reconnect_interval(), Duration::from_secs(2));
        assert_eq!(config.supervisor.connector_backoff.steps, 3);
        assert_eq!(
            config.supervisor.connector_backoff.duration,
            Duration::from_millis(250)
        );
        assert_eq!(config.leader.lease_ttl_seconds, 30);
        assert_eq!(config.leader.renew_interval_seconds, 5);
        assert_eq!(config.secrets.root.to_str(), Some("/run/secrets"));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[supervisor]\nreconnect_interval_seconds = 9").unwrap();

        let config: GatewayConfig = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.supervisor.reconnect_interval_seconds, 9);
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = load_config::<GatewayConfig>("/nonexistent/eventgate.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/eventgate.toml"));
    }
}
