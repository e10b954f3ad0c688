//! Core NATS subscriber connector.

use super::dispatch_outcome;
use crate::connector::Connector;
use crate::eventsource::EventSourceType;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use eventgate::event::Dispatcher;
use eventgate::filter::FilterConfig;
use eventgate::retry::{retry, RetryError};
use eventgate::secrets::{SecretKeySelector, SecretStore};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum NatsAuth {
    Token(SecretKeySelector),
    Basic {
        username: SecretKeySelector,
        password: SecretKeySelector,
    },
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct NatsEventSource {
    pub url: String,
    pub subject: String,
    /// Queue group; replicas in the same group share messages
    #[serde(default)]
    pub queue: Option<String>,
    /// Embed message bodies as JSON instead of base64
    #[serde(default)]
    pub json_body: bool,
    #[serde(default)]
    pub auth: Option<NatsAuth>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub filter: Option<FilterConfig>,
}

pub struct NatsConnector {
    event_source_name: String,
    event_name: String,
    spec: NatsEventSource,
    secrets: SecretStore,
}

impl NatsConnector {
    pub fn new(
        event_source_name: impl Into<String>,
        event_name: impl Into<String>,
        spec: NatsEventSource,
        secrets: SecretStore,
    ) -> Self {
        Self {
            event_source_name: event_source_name.into(),
            event_name: event_name.into(),
            spec,
            secrets,
        }
    }

    fn connect_options(&self) -> Result<async_nats::ConnectOptions> {
        let options = async_nats::ConnectOptions::new();
        let options = match &self.spec.auth {
            None => options,
            Some(NatsAuth::Token(selector)) => options.token(self.secrets.read(selector)?),
            Some(NatsAuth::Basic { username, password }) => {
                options.user_and_password(self.secrets.read(username)?, self.secrets.read(password)?)
            }
        };
        Ok(options)
    }

    async fn connect(&self) -> Result<async_nats::Client> {
        info!(url = %self.spec.url, event_name = %self.event_name, "Connecting to NATS cluster");
        retry(None, || async {
            self.connect_options()?
                .connect(self.spec.url.as_str())
                .await
                .context("failed to connect to NATS")
        })
        .await
        .map_err(RetryError::into_inner)
        .with_context(|| format!("failed to connect to the nats server for event {}", self.event_name))
    }
}

/// Builds `{subject, header, body, metadata}` for one message.
///
/// With `json_body` the body is embedded as JSON and a non-JSON body is an
/// error; otherwise it is carried base64-encoded.
fn event_payload(
    subject: &str,
    headers: Option<&async_nats::HeaderMap>,
    body: &[u8],
    json_body: bool,
    metadata: &BTreeMap<String, String>,
) -> Result<Vec<u8>> {
    let body = if json_body {
        serde_json::from_slice::<Value>(body).context("message body is not valid JSON")?
    } else {
        Value::String(base64::engine::general_purpose::STANDARD.encode(body))
    };

    let mut header: BTreeMap<String, Vec<String>> = BTreeMap::new();
    if let Some(headers) = headers {
        for (name, values) in headers.iter() {
            header
                .entry(name.to_string())
                .or_default()
                .extend(values.iter().map(|v| v.to_string()));
        }
    }

    let event = json!({
        "subject": subject,
        "header": header,
        "body": body,
        "metadata": metadata,
    });
    Ok(event.to_string().into_bytes())
}

#[async_trait]
impl Connector for NatsConnector {
    fn event_name(&self) -> &str {
        &self.event_name
    }

    fn event_source_name(&self) -> &str {
        &self.event_source_name
    }

    fn event_source_type(&self) -> EventSourceType {
        EventSourceType::Nats
    }

    async fn validate(&self) -> Result<()> {
        if self.spec.url.is_empty() {
            bail!("url must be specified");
        }
        if self.spec.subject.is_empty() {
            bail!("subject must be specified");
        }
        if matches!(&self.spec.queue, Some(q) if q.is_empty()) {
            bail!("queue group must not be empty");
        }
        Ok(())
    }

    async fn listen(&self, ctx: CancellationToken, dispatch: Arc<dyn Dispatcher>) -> Result<()> {
        info!(
            event_source = %self.event_source_name,
            event_name = %self.event_name,
            "Started processing the NATS event source"
        );
        let client = self.connect().await?;

        let mut subscriber = match &self.spec.queue {
            Some(queue) => client
                .queue_subscribe(self.spec.subject.clone(), queue.clone())
                .await,
            None => client.subscribe(self.spec.subject.clone()).await,
        }
        .with_context(|| format!("failed to subscribe to the subject {}", self.spec.subject))?;
        info!(subject = %self.spec.subject, queue = ?self.spec.queue, "Subscribed to NATS subject");

        let result = loop {
            let message = tokio::select! {
                _ = ctx.cancelled() => break Ok(()),
                message = subscriber.next() => message,
            };
            let Some(message) = message else {
                break Err(anyhow::anyhow!("subscription to {} closed", self.spec.subject));
            };

            let payload = match event_payload(
                message.subject.as_str(),
                message.headers.as_ref(),
                &message.payload,
                self.spec.json_body,
                &self.spec.metadata,
            ) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(
                        event_name = %self.event_name,
                        error = %e,
                        "Failed to build the event payload, rejecting the message"
                    );
                    continue;
                }
            };
            if let Err(e) = dispatch_outcome(
                dispatch.dispatch(payload, &[]).await,
                &self.event_source_name,
                &self.event_name,
            ) {
                break Err(e);
            }
        };

        if let Err(e) = subscriber.unsubscribe().await {
            error!(error = %e, "Failed to unsubscribe");
        }
        info!(event_name = %self.event_name, "Event source is stopped");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> NatsEventSource {
        toml::from_str(
            r#"
                url = "nats://localhost:4222"
                subject = "orders.created"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_auth_variants() {
        let spec: NatsEventSource = toml::from_str(
            r#"
                url = "nats://localhost:4222"
                subject = "orders"

                [auth.basic]
                username = { name = "nats", key = "user" }
                password = { name = "nats", key = "pass" }
            "#,
        )
        .unwrap();
        assert!(matches!(spec.auth, Some(NatsAuth::Basic { .. })));

        let spec: NatsEventSource = toml::from_str(
            r#"
                url = "nats://localhost:4222"
                subject = "orders"
                auth = { token = { name = "nats", key = "token" } }
            "#,
        )
        .unwrap();
        assert!(matches!(spec.auth, Some(NatsAuth::Token(_))));
    }

    #[test]
    fn test_binary_body_is_base64() {
        let payload = event_payload("orders.created", None, b"hello", false, &BTreeMap::new()).unwrap();
        let value: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["subject"], "orders.created");
        assert_eq!(value["body"], "aGVsbG8=");
    }

    #[test]
    fn test_json_body_is_embedded() {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert("trace", "abc");
        let metadata = BTreeMap::from([("env".to_string(), "prod".to_string())]);

        let payload =
            event_payload("orders.created", Some(&headers), br#"{"id":7}"#, true, &metadata).unwrap();
        let value: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["body"]["id"], 7);
        assert_eq!(value["header"]["trace"][0], "abc");
        assert_eq!(value["metadata"]["env"], "prod");
    }

    #[test]
    fn test_invalid_json_body_is_rejected() {
        assert!(event_payload("s", None, b"not json", true, &BTreeMap::new()).is_err());
    }

    #[tokio::test]
    async fn test_validate() {
        let store = SecretStore::new("/nonexistent");
        assert!(NatsConnector::new("es", "orders", spec(), store.clone()).validate().await.is_ok());

        let mut missing_subject = spec();
        missing_subject.subject.clear();
        assert!(NatsConnector::new("es", "orders", missing_subject, store.clone())
            .validate()
            .await
            .is_err());

        let mut empty_queue = spec();
        empty_queue.queue = Some(String::new());
        assert!(NatsConnector::new("es", "orders", empty_queue, store).validate().await.is_err());
    }

    #[test]
    fn test_missing_auth_secret_fails_options() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = spec();
        spec.auth = Some(NatsAuth::Token(SecretKeySelector {
            name: "nats".to_string(),
            key: "token".to_string(),
        }));
        let connector = NatsConnector::new("es", "orders", spec, SecretStore::new(dir.path()));
        assert!(connector.connect_options().is_err());
    }
}
