//! Dispatcher handed to each connector: filter, envelope, publish.

use crate::eventsource::EventSourceType;
use async_trait::async_trait;
use eventgate::bus::{BusMessage, MessageHeader, SharedConnection};
use eventgate::event::{DispatchError, Dispatcher, EventEnvelope, EventOption};
use eventgate::filter::EventFilter;
use eventgate::metrics::EventMetrics;
use eventgate::retry::{retry_charged, Charge};
use tracing::{debug, error, warn};

/// Publishes the messages of one connector onto the shared bus connection.
pub struct BusDispatcher {
    event_source_name: String,
    event_name: String,
    event_type: EventSourceType,
    filter: Option<EventFilter>,
    connection: SharedConnection,
    metrics: EventMetrics,
}

impl BusDispatcher {
    pub fn new(
        event_source_name: impl Into<String>,
        event_name: impl Into<String>,
        event_type: EventSourceType,
        filter: Option<EventFilter>,
        connection: SharedConnection,
        metrics: EventMetrics,
    ) -> Self {
        Self {
            event_source_name: event_source_name.into(),
            event_name: event_name.into(),
            event_type,
            filter,
            connection,
            metrics,
        }
    }

    fn filter_passes(&self, payload: &[u8]) -> bool {
        let Some(filter) = &self.filter else {
            return true;
        };
        match filter.apply(payload) {
            Ok(true) => true,
            Ok(false) => {
                debug!(
                    event_source = %self.event_source_name,
                    event_name = %self.event_name,
                    "Event does not pass the filter, dropping it"
                );
                false
            }
            Err(e) => {
                warn!(
                    event_source = %self.event_source_name,
                    event_name = %self.event_name,
                    filter = %filter.expression(),
                    error = %e,
                    "Failed to apply filter, dropping event"
                );
                false
            }
        }
    }
}

#[async_trait]
impl Dispatcher for BusDispatcher {
    async fn dispatch(&self, payload: Vec<u8>, options: &[EventOption]) -> Result<(), DispatchError> {
        if !self.filter_passes(&payload) {
            return Ok(());
        }

        let envelope = EventEnvelope::build(
            self.event_type.as_str(),
            &self.event_source_name,
            &self.event_name,
            payload,
            options,
        )
        .map_err(|e| {
            self.metrics
                .event_processing_failed(&self.event_source_name, &self.event_name);
            DispatchError::from(e)
        })?;
        let body = envelope.to_json().map_err(|e| {
            self.metrics
                .event_processing_failed(&self.event_source_name, &self.event_name);
            DispatchError::from(e)
        })?;

        let Some(connection) = self.connection.current() else {
            self.metrics
                .event_send_failed(&self.event_source_name, &self.event_name);
            return Err(DispatchError::BusUnavailable(
                "event bus connection is closed".to_string(),
            ));
        };

        let message = BusMessage {
            header: MessageHeader {
                event_source_name: self.event_source_name.clone(),
                event_name: self.event_name.clone(),
                id: envelope.id.clone(),
            },
            body,
        };

        // Stop retrying once the handle itself reports closed.
        let published = retry_charged(
            None,
            None,
            || connection.publish(&message),
            |_| {
                if connection.is_closed() {
                    Charge::Stop
                } else {
                    Charge::Step
                }
            },
        )
        .await;

        if let Err(e) = published {
            self.metrics
                .event_send_failed(&self.event_source_name, &self.event_name);
            if connection.is_closed() {
                warn!(
                    event_source = %self.event_source_name,
                    event_name = %self.event_name,
                    event_id = %envelope.id,
                    error = %e.last,
                    "Event bus connection closed while publishing"
                );
                return Err(DispatchError::BusUnavailable(format!(
                    "connection closed while publishing: {:#}",
                    e.last
                )));
            }
            error!(
                event_source = %self.event_source_name,
                event_name = %self.event_name,
                event_id = %envelope.id,
                error = %e.last,
                "Failed to publish event"
            );
            return Err(DispatchError::Publish {
                id: envelope.id,
                reason: format!("after {} retries: {:#}", e.attempts, e.last),
            });
        }

        debug!(
            event_source = %self.event_source_name,
            event_name = %self.event_name,
            event_id = %envelope.id,
            "Succeeded to publish an event"
        );
        self.metrics
            .event_sent(&self.event_source_name, &self.event_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use eventgate::bus::{BusMessage, EventBusConnection};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    /// Connection whose publishes fail; optionally it closes on the first one.
    #[derive(Default)]
    struct FailingConnection {
        close_on_publish: bool,
        closed: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventBusConnection for FailingConnection {
        async fn publish(&self, _message: &BusMessage) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.close_on_publish {
                self.closed.store(true, Ordering::SeqCst);
                return Err(anyhow!("connection closed"));
            }
            Err(anyhow!("no responders"))
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn dispatcher(connection: Arc<FailingConnection>, metrics: EventMetrics) -> BusDispatcher {
        let shared = SharedConnection::new();
        shared.replace(connection);
        BusDispatcher::new("es", "hook", EventSourceType::Webhook, None, shared, metrics)
    }

    #[tokio::test]
    async fn test_connection_closing_mid_publish_is_bus_unavailable() {
        let connection = Arc::new(FailingConnection {
            close_on_publish: true,
            ..Default::default()
        });
        let metrics = EventMetrics::new();
        let dispatcher = dispatcher(connection.clone(), metrics.clone());
        let started = Instant::now();

        let err = dispatcher.dispatch(br#"{"a":1}"#.to_vec(), &[]).await.unwrap_err();

        assert!(matches!(err, DispatchError::BusUnavailable(_)), "{:?}", err);
        assert_eq!(connection.calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(metrics.get("es", "hook").unwrap().send_failures, 1);
    }

    #[tokio::test]
    async fn test_missing_connection_fails_fast() {
        let metrics = EventMetrics::new();
        let dispatcher = BusDispatcher::new(
            "es",
            "hook",
            EventSourceType::Webhook,
            None,
            SharedConnection::new(),
            metrics.clone(),
        );

        let err = dispatcher.dispatch(b"{}".to_vec(), &[]).await.unwrap_err();
        assert!(matches!(err, DispatchError::BusUnavailable(_)));
        assert_eq!(metrics.get("es", "hook").unwrap().send_failures, 1);
    }

    #[tokio::test]
    async fn test_filtered_payload_is_not_published() {
        let connection = Arc::new(FailingConnection::default());
        let shared = SharedConnection::new();
        shared.replace(connection.clone());
        let filter = EventFilter::parse("x == 1").unwrap();
        let dispatcher = BusDispatcher::new(
            "es",
            "hook",
            EventSourceType::Webhook,
            Some(filter),
            shared,
            EventMetrics::new(),
        );

        dispatcher.dispatch(br#"{"x":2}"#.to_vec(), &[]).await.unwrap();
        assert_eq!(connection.calls.load(Ordering::SeqCst), 0);
    }
}
