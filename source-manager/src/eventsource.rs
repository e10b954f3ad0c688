//! Declarative event source definition.

use crate::connectors::calendar::CalendarEventSource;
use crate::connectors::github::GithubEventSource;
use crate::connectors::nats::NatsEventSource;
use crate::connectors::webhook::WebhookEventSource;
use anyhow::{bail, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Connector types whose replicas must not run concurrently; event sources
/// containing one of them run under leader election.
pub const RECREATE_TYPES: &[EventSourceType] = &[
    EventSourceType::Github,
    EventSourceType::Calendar,
    EventSourceType::Nats,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSourceType {
    Webhook,
    Github,
    Calendar,
    Nats,
}

impl EventSourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSourceType::Webhook => "webhook",
            EventSourceType::Github => "github",
            EventSourceType::Calendar => "calendar",
            EventSourceType::Nats => "nats",
        }
    }

    pub fn is_recreate(&self) -> bool {
        RECREATE_TYPES.contains(self)
    }
}

impl fmt::Display for EventSourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named group of connector entries sharing one bus identity.
#[derive(Debug, Clone, Deserialize)]
pub struct EventSource {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default)]
    pub webhook: BTreeMap<String, WebhookEventSource>,
    #[serde(default)]
    pub github: BTreeMap<String, GithubEventSource>,
    #[serde(default)]
    pub calendar: BTreeMap<String, CalendarEventSource>,
    #[serde(default)]
    pub nats: BTreeMap<String, NatsEventSource>,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_replicas() -> u32 {
    1
}

impl EventSource {
    /// Event names across every connector type, in type order.
    pub fn event_names(&self) -> Vec<&str> {
        self.webhook
            .keys()
            .chain(self.github.keys())
            .chain(self.calendar.keys())
            .chain(self.nats.keys())
            .map(String::as_str)
            .collect()
    }

    /// Connector types with at least one entry.
    pub fn types(&self) -> Vec<EventSourceType> {
        let mut types = Vec::new();
        if !self.webhook.is_empty() {
            types.push(EventSourceType::Webhook);
        }
        if !self.github.is_empty() {
            types.push(EventSourceType::Github);
        }
        if !self.calendar.is_empty() {
            types.push(EventSourceType::Calendar);
        }
        if !self.nats.is_empty() {
            types.push(EventSourceType::Nats);
        }
        types
    }

    pub fn needs_leader_election(&self) -> bool {
        self.types().iter().any(EventSourceType::is_recreate)
    }

    /// Sanity checks that apply to the whole event source.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("event source name is required");
        }
        let names = self.event_names();
        if names.is_empty() {
            bail!("event source {} has no events", self.name);
        }
        let mut seen = HashSet::new();
        for name in names {
            if !seen.insert(name) {
                bail!("event name '{}' is used more than once in event source {}", name, self.name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> EventSource {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn test_webhook_only_source_runs_without_leader() {
        let source = parse(
            r#"
                name = "ingress"

                [webhook.example]
                endpoint = "/hook"
                port = 12000
            "#,
        );
        assert_eq!(source.namespace, "default");
        assert_eq!(source.replicas, 1);
        assert_eq!(source.types(), vec![EventSourceType::Webhook]);
        assert!(!source.needs_leader_election());
        assert!(source.validate().is_ok());
    }

    #[test]
    fn test_recreate_type_requires_leader() {
        let source = parse(
            r#"
                name = "mixed"
                namespace = "argo"

                [webhook.example]
                endpoint = "/hook"
                port = 12000

                [calendar.tick]
                interval = "10s"
            "#,
        );
        assert!(source.needs_leader_election());
        assert_eq!(source.event_names(), vec!["example", "tick"]);
    }

    #[test]
    fn test_duplicate_event_names_are_rejected() {
        let source = parse(
            r#"
                name = "dup"

                [webhook.same]
                endpoint = "/hook"
                port = 12000

                [calendar.same]
                interval = "1m"
            "#,
        );
        let err = source.validate().unwrap_err();
        assert!(err.to_string().contains("'same'"));
    }

    #[test]
    fn test_empty_source_is_rejected() {
        assert!(parse(r#"name = "empty""#).validate().is_err());
        assert!(parse(r#"name = "  ""#).validate().is_err());
    }

    #[test]
    fn test_type_names() {
        assert_eq!(EventSourceType::Github.to_string(), "github");
        assert!(EventSourceType::Nats.is_recreate());
        assert!(!EventSourceType::Webhook.is_recreate());
    }
}
