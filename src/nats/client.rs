use super::publisher::JetStreamConnection;
use crate::bus::{EventBusConnection, EventBusDriver};
use anyhow::{Context, Result};
use async_nats::jetstream::{self, stream};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

/// NATS configuration
#[derive(Clone, Debug, Deserialize)]
pub struct NatsConfig {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_stream_name")]
    pub stream_name: String,
    #[serde(default = "default_stream_subjects")]
    pub stream_subjects: Vec<String>,
    /// Messages go to `{subject_prefix}.{event_source}.{event_name}`
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
    #[serde(default = "default_max_age_days")]
    pub max_age_days: i64,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: i64,
}

fn default_url() -> String {
    std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string())
}

fn default_stream_name() -> String {
    "EVENTGATE".to_string()
}

fn default_stream_subjects() -> Vec<String> {
    vec!["eventgate.>".to_string()]
}

fn default_subject_prefix() -> String {
    "eventgate".to_string()
}

fn default_max_age_days() -> i64 {
    7
}

fn default_max_bytes() -> i64 {
    10 * 1024 * 1024 * 1024 // 10GB
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            stream_name: default_stream_name(),
            stream_subjects: default_stream_subjects(),
            subject_prefix: default_subject_prefix(),
            max_age_days: default_max_age_days(),
            max_bytes: default_max_bytes(),
        }
    }
}

impl NatsConfig {
    /// Subject an event from `event_source`/`event_name` is published on.
    pub fn subject_for(&self, event_source: &str, event_name: &str) -> String {
        format!("{}.{}.{}", self.subject_prefix, event_source, event_name)
    }
}

/// Connects to NATS and prepares the JetStream stream events land in.
pub struct JetStreamDriver {
    config: NatsConfig,
}

impl JetStreamDriver {
    pub fn new(config: NatsConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }

    /// Ensure JetStream stream exists with proper configuration
    async fn ensure_stream(&self, jetstream: &jetstream::Context) -> Result<()> {
        info!(stream = %self.config.stream_name, "Ensuring JetStream stream exists");

        if jetstream.get_stream(&self.config.stream_name).await.is_ok() {
            info!(stream = %self.config.stream_name, "Stream already exists");
            return Ok(());
        }

        let stream_config = stream::Config {
            name: self.config.stream_name.clone(),
            subjects: self.config.stream_subjects.clone(),
            max_age: std::time::Duration::from_secs((self.config.max_age_days * 86400) as u64),
            max_bytes: self.config.max_bytes,
            storage: stream::StorageType::File,
            retention: stream::RetentionPolicy::Limits,
            ..Default::default()
        };

        jetstream
            .create_stream(stream_config)
            .await
            .context("Failed to create JetStream stream")?;

        info!(stream = %self.config.stream_name, "Created JetStream stream");
        Ok(())
    }
}

#[async_trait]
impl EventBusDriver for JetStreamDriver {
    async fn connect(&self, client_id: &str) -> Result<Arc<dyn EventBusConnection>> {
        info!(url = %self.config.url, client_id = %client_id, "Connecting to NATS");

        let client = async_nats::ConnectOptions::new()
            .name(client_id)
            .connect(self.config.url.as_str())
            .await
            .context("Failed to connect to NATS")?;

        let jetstream = jetstream::new(client.clone());
        self.ensure_stream(&jetstream).await?;

        Ok(Arc::new(JetStreamConnection::new(
            client,
            jetstream,
            self.config.clone(),
        )))
    }
}
