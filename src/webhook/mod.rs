//! Shared HTTP ingress for webhook-style connectors.
//!
//! Connectors describe an endpoint with a [`WebhookContext`], wrap it in a
//! [`Route`] and implement [`RouteHandler`] to turn requests into payloads.
//! [`manage_route`] drives a route through its lifecycle on a
//! [`RouteMultiplexer`], which owns the per-port listeners.

mod error;
mod multiplexer;
mod route;


pub use error::{success, WebhookError};
pub use multiplexer::RouteMultiplexer;
pub use route::{DispatchRequest, Route};

use crate::event::Dispatcher;
use crate::secrets::SecretKeySelector;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, Method};
use axum::response::Response;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Pending requests a route buffers before callers start waiting on send.
const DISPATCH_QUEUE: usize = 16;

/// HTTP endpoint a webhook route listens on.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct WebhookContext {
    /// Path, e.g. `/push`
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub port: u16,
    /// Externally reachable base URL, used when registering hooks upstream
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub server_cert_secret: Option<SecretKeySelector>,
    #[serde(default)]
    pub server_key_secret: Option<SecretKeySelector>,
    /// Secret holding the bearer token callers must present
    #[serde(default)]
    pub auth_secret: Option<SecretKeySelector>,
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_max_payload_size() -> usize {
    1_048_576 // 1MB
}

impl WebhookContext {
    pub fn new(endpoint: impl Into<String>, port: u16) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: default_method(),
            port,
            url: String::new(),
            server_cert_secret: None,
            server_key_secret: None,
            auth_secret: None,
            max_payload_size: default_max_payload_size(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.endpoint.starts_with('/') {
            bail!("endpoint '{}' must start with '/'", self.endpoint);
        }
        if self.endpoint == "/health" {
            bail!("endpoint '/health' is reserved");
        }
        Method::from_bytes(self.method.as_bytes())
            .map_err(|_| anyhow!("invalid HTTP method '{}'", self.method))?;
        if self.server_cert_secret.is_some() != self.server_key_secret.is_some() {
            bail!("server cert and key secrets must be set together");
        }
        if self.max_payload_size == 0 {
            bail!("max payload size must be greater than zero");
        }
        Ok(())
    }

    pub fn tls_enabled(&self) -> bool {
        self.server_cert_secret.is_some() && self.server_key_secret.is_some()
    }

    pub fn accepts(&self, method: &Method) -> bool {
        self.method.eq_ignore_ascii_case(method.as_str())
    }

    /// Public URL of the endpoint, `{url}{endpoint}`.
    pub fn public_url(&self) -> String {
        format!("{}{}", self.url.trim_end_matches('/'), self.endpoint)
    }
}

/// Request as handed to a connector. The Authorization header is masked.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub query: Option<String>,
    pub body: Bytes,
}

/// Connector side of a webhook route.
#[async_trait]
pub trait RouteHandler: Send + Sync {
    fn route(&self) -> &Arc<Route>;

    /// Decodes the request and dispatches it through
    /// [`Route::dispatch_event`].
    async fn handle(&self, request: WebhookRequest) -> Response;

    /// Runs after the route is serving, e.g. to register an upstream hook.
    async fn post_activate(&self) -> Result<()> {
        Ok(())
    }

    /// Runs after the route stopped serving.
    async fn post_inactivate(&self) -> Result<()> {
        Ok(())
    }
}

/// Drives one route from activation to shutdown.
///
/// Validates the context, starts the drain task that publishes queued
/// payloads, activates the route and runs `post_activate`, then blocks until
/// `ctx` is cancelled. On the way out the route is marked inactive,
/// `post_inactivate` runs (errors are logged) and the drain task stops.
pub async fn manage_route(
    ctx: CancellationToken,
    handler: Arc<dyn RouteHandler>,
    mux: &RouteMultiplexer,
    dispatcher: Arc<dyn Dispatcher>,
) -> Result<()> {
    let route = handler.route().clone();
    route
        .context
        .validate()
        .with_context(|| format!("invalid webhook route {}/{}", route.event_source_name, route.event_name))?;

    let receiver = route.open_channel(DISPATCH_QUEUE);
    let stop = CancellationToken::new();
    let drain = tokio::spawn(drain(route.clone(), receiver, dispatcher, stop.clone()));

    let started = async {
        mux.activate(handler.clone()).await?;
        handler
            .post_activate()
            .await
            .context("post-activation hook failed")
    }
    .await;

    if let Err(e) = started {
        route.set_active(false);
        route.close_channel();
        stop.cancel();
        let _ = drain.await;
        return Err(e);
    }

    ctx.cancelled().await;

    route.set_active(false);
    info!(
        endpoint = %route.context.endpoint,
        port = route.context.port,
        "Route deactivated"
    );

    if let Err(e) = handler.post_inactivate().await {
        error!(
            event_source = %route.event_source_name,
            event_name = %route.event_name,
            error = %e,
            "Post-inactivation hook failed"
        );
    }

    route.close_channel();
    stop.cancel();
    let _ = drain.await;
    Ok(())
}

/// Publishes queued payloads and answers each waiting request.
///
/// On `stop` the channel is closed and whatever is already queued is still
/// published.
async fn drain(
    route: Arc<Route>,
    mut receiver: mpsc::Receiver<DispatchRequest>,
    dispatcher: Arc<dyn Dispatcher>,
    stop: CancellationToken,
) {
    let mut closed = false;
    loop {
        // Queued requests were accepted and are answered before stopping.
        let request = tokio::select! {
            biased;
            request = receiver.recv() => match request {
                Some(request) => request,
                None => break,
            },
            _ = stop.cancelled(), if !closed => {
                receiver.close();
                closed = true;
                continue;
            }
        };

        let ok = match dispatcher.dispatch(request.payload, &request.options).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    event_source = %route.event_source_name,
                    event_name = %route.event_name,
                    error = %e,
                    "Failed to dispatch webhook event"
                );
                false
            }
        };
        let _ = request.reply.send(ok);
    }
}
