use crate::eventsource::EventSource;
use anyhow::{Context, Result};
use eventgate::config::{load_config, GatewayConfig};
use serde::Deserialize;

/// Configuration file of the source manager: the shared gateway sections
/// plus the `[eventsource]` it runs.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    #[serde(flatten)]
    pub gateway: GatewayConfig,
    pub eventsource: EventSource,
}

impl ManagerConfig {
    pub fn load(path: &str) -> Result<Self> {
        let config: Self = load_config(path)?;
        config
            .gateway
            .validate()
            .with_context(|| format!("Invalid config file {}", path))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventgate::config::parse_config;
    use std::io::Write;

    #[test]
    fn test_sections_and_eventsource() {
        let config: ManagerConfig = parse_config(
            r#"
                [nats]
                url = "nats://bus:4222"

                [supervisor]
                reconnect_interval_seconds = 3

                [eventsource]
                name = "ingress"
                namespace = "argo"

                [eventsource.webhook.example]
                endpoint = "/example"
                port = 12000
            "#,
        )
        .unwrap();

        assert_eq!(config.gateway.nats.url, "nats://bus:4222");
        assert_eq!(config.gateway.supervisor.reconnect_interval_seconds, 3);
        assert_eq!(config.gateway.leader.lease_ttl_seconds, 15);
        assert_eq!(config.eventsource.name, "ingress");
        assert_eq!(config.eventsource.webhook["example"].context.port, 12000);
    }

    #[test]
    fn test_eventsource_is_required() {
        assert!(parse_config::<ManagerConfig>("[nats]\nurl = \"nats://bus:4222\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[eventsource]\nname = \"cron\"\n\n[eventsource.calendar.tick]\ninterval = \"1m\""
        )
        .unwrap();

        let config = ManagerConfig::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.eventsource.calendar["tick"].interval.as_deref(), Some("1m"));
        assert!(config.eventsource.needs_leader_election());
    }

    #[test]
    fn test_load_rejects_non_finite_backoff() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[supervisor.connector_backoff]\nduration_ms = 100\nfactor = 1.0\njitter = nan\nsteps = 3\n\n\
             [eventsource]\nname = \"cron\"\n\n[eventsource.calendar.tick]\ninterval = \"1m\""
        )
        .unwrap();

        let err = ManagerConfig::load(file.path().to_str().unwrap()).unwrap_err();
        assert!(format!("{:#}", err).contains("jitter"));
    }
}
