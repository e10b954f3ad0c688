//! Connector registry - Builds one connector per event source entry.

use crate::connector::Connector;
use crate::connectors::calendar::CalendarConnector;
use crate::connectors::github::GithubConnector;
use crate::connectors::nats::NatsConnector;
use crate::connectors::webhook::WebhookConnector;
use crate::eventsource::{EventSource, EventSourceType};
use anyhow::Result;
use eventgate::filter::FilterConfig;
use eventgate::secrets::SecretStore;
use eventgate::webhook::RouteMultiplexer;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Connectors of one event source plus the filter declared on each entry.
#[derive(Default)]
pub struct ConnectorSet {
    pub connectors: Vec<Arc<dyn Connector>>,
    /// Filter per event name
    pub filters: HashMap<String, FilterConfig>,
}

impl ConnectorSet {
    pub fn push(&mut self, connector: Arc<dyn Connector>, filter: Option<FilterConfig>) {
        if let Some(filter) = filter {
            self.filters.insert(connector.event_name().to_string(), filter);
        }
        self.connectors.push(connector);
    }

    pub fn filter_for(&self, event_name: &str) -> Option<&FilterConfig> {
        self.filters.get(event_name)
    }

    /// Connectors grouped by type.
    pub fn by_type(&self) -> BTreeMap<EventSourceType, Vec<Arc<dyn Connector>>> {
        let mut grouped: BTreeMap<EventSourceType, Vec<Arc<dyn Connector>>> = BTreeMap::new();
        for connector in &self.connectors {
            grouped
                .entry(connector.event_source_type())
                .or_default()
                .push(Arc::clone(connector));
        }
        grouped
    }

    pub fn needs_leader_election(&self) -> bool {
        self.connectors
            .iter()
            .any(|c| c.event_source_type().is_recreate())
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}

/// Builds every connector `source` declares.
///
/// Fails only if the event source as a whole is invalid; per-entry problems
/// surface later when the supervisor validates each connector.
pub fn build_connectors(
    source: &EventSource,
    mux: &RouteMultiplexer,
    secrets: &SecretStore,
) -> Result<ConnectorSet> {
    source.validate()?;
    let mut set = ConnectorSet::default();

    for (name, spec) in &source.webhook {
        set.push(
            Arc::new(WebhookConnector::new(&source.name, name, spec.clone(), mux.clone())),
            spec.filter.clone(),
        );
    }
    for (name, spec) in &source.github {
        set.push(
            Arc::new(GithubConnector::new(
                &source.name,
                name,
                spec.clone(),
                mux.clone(),
                secrets.clone(),
            )),
            spec.filter.clone(),
        );
    }
    for (name, spec) in &source.calendar {
        set.push(
            Arc::new(CalendarConnector::new(&source.name, name, spec.clone())),
            spec.filter.clone(),
        );
    }
    for (name, spec) in &source.nats {
        set.push(
            Arc::new(NatsConnector::new(&source.name, name, spec.clone(), secrets.clone())),
            spec.filter.clone(),
        );
    }

    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(toml_str: &str) -> EventSource {
        toml::from_str(toml_str).unwrap()
    }

    #[tokio::test]
    async fn test_builds_one_connector_per_entry() {
        let source = source(
            r#"
                name = "mixed"

                [webhook.hook]
                endpoint = "/hook"
                port = 12000

                [webhook.hook.filter]
                expression = "x == 1"

                [calendar.tick]
                interval = "10s"

                [nats.orders]
                url = "nats://localhost:4222"
                subject = "orders"
            "#,
        );
        let mux = RouteMultiplexer::new(SecretStore::new("/nonexistent"));
        let set = build_connectors(&source, &mux, &SecretStore::new("/nonexistent")).unwrap();

        assert_eq!(set.len(), 3);
        assert!(set.needs_leader_election());
        assert_eq!(set.filter_for("hook").unwrap().expression, "x == 1");
        assert!(set.filter_for("tick").is_none());

        let grouped = set.by_type();
        assert_eq!(grouped[&EventSourceType::Webhook].len(), 1);
        assert_eq!(grouped[&EventSourceType::Calendar][0].event_name(), "tick");
        assert_eq!(grouped[&EventSourceType::Nats][0].event_source_name(), "mixed");
    }

    #[tokio::test]
    async fn test_webhook_only_set_needs_no_leader() {
        let source = source(
            r#"
                name = "ingress"

                [webhook.a]
                endpoint = "/a"
                port = 12000

                [webhook.b]
                endpoint = "/b"
                port = 12000
            "#,
        );
        let mux = RouteMultiplexer::new(SecretStore::new("/nonexistent"));
        let set = build_connectors(&source, &mux, &SecretStore::new("/nonexistent")).unwrap();
        assert_eq!(set.len(), 2);
        assert!(!set.needs_leader_election());
    }

    #[tokio::test]
    async fn test_invalid_source_is_rejected() {
        let mux = RouteMultiplexer::new(SecretStore::new("/nonexistent"));
        assert!(build_connectors(&source(r#"name = "empty""#), &mux, &SecretStore::new("/x")).is_err());
    }
}
