use super::client::NatsConfig;
use crate::bus::{BusMessage, EventBusConnection};
use anyhow::{Context, Result};
use async_nats::connection::State;
use async_nats::jetstream;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// One JetStream session used to publish envelopes.
pub struct JetStreamConnection {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    config: NatsConfig,
    closed: AtomicBool,
}

impl JetStreamConnection {
    pub(crate) fn new(
        client: async_nats::Client,
        jetstream: jetstream::Context,
        config: NatsConfig,
    ) -> Self {
        Self {
            client,
            jetstream,
            config,
            closed: AtomicBool::new(false),
        }
    }

    /// Get underlying NATS client
    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }
}

#[async_trait]
impl EventBusConnection for JetStreamConnection {
    /// Publish a single message and wait for the JetStream ack.
    ///
    /// Subject format: {prefix}.{event_source}.{event_name}
    /// The envelope id is sent as `Nats-Msg-Id` so redeliveries are deduplicated.
    async fn publish(&self, message: &BusMessage) -> Result<()> {
        let subject = self
            .config
            .subject_for(&message.header.event_source_name, &message.header.event_name);

        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Msg-Id", message.header.id.as_str());

        debug!(
            event_id = %message.header.id,
            subject = %subject,
            "Publishing event to NATS"
        );

        self.jetstream
            .publish_with_headers(subject.clone(), headers, message.body.clone().into())
            .await
            .with_context(|| format!("Failed to publish event to subject '{}'", subject))?
            .await
            .context("Failed to await publish ack")?;

        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
            || matches!(self.client.connection_state(), State::Disconnected)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.client.flush().await {
            warn!(error = %e, "Failed to flush NATS connection on close");
        }
    }
}
