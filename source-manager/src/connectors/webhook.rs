//! Generic webhook receiver.

use crate::connector::Connector;
use crate::eventsource::EventSourceType;
use anyhow::Result;
use async_trait::async_trait;
use axum::http::{header, Method};
use axum::response::{IntoResponse, Response};
use eventgate::event::Dispatcher;
use eventgate::filter::FilterConfig;
use eventgate::webhook::{
    manage_route, Route, RouteHandler, RouteMultiplexer, WebhookContext, WebhookError,
    WebhookRequest,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct WebhookEventSource {
    #[serde(flatten)]
    pub context: WebhookContext,
    #[serde(default)]
    pub filter: Option<FilterConfig>,
}

pub struct WebhookConnector {
    event_source_name: String,
    event_name: String,
    spec: WebhookEventSource,
    mux: RouteMultiplexer,
}

impl WebhookConnector {
    pub fn new(
        event_source_name: impl Into<String>,
        event_name: impl Into<String>,
        spec: WebhookEventSource,
        mux: RouteMultiplexer,
    ) -> Self {
        Self {
            event_source_name: event_source_name.into(),
            event_name: event_name.into(),
            spec,
            mux,
        }
    }
}

#[async_trait]
impl Connector for WebhookConnector {
    fn event_name(&self) -> &str {
        &self.event_name
    }

    fn event_source_name(&self) -> &str {
        &self.event_source_name
    }

    fn event_source_type(&self) -> EventSourceType {
        EventSourceType::Webhook
    }

    async fn validate(&self) -> Result<()> {
        self.spec.context.validate()
    }

    async fn listen(&self, ctx: CancellationToken, dispatch: Arc<dyn Dispatcher>) -> Result<()> {
        info!(
            event_source = %self.event_source_name,
            event_name = %self.event_name,
            "Started processing the webhook event source"
        );
        let handler = Arc::new(WebhookHandler {
            route: Arc::new(Route::new(
                self.spec.context.clone(),
                &self.event_source_name,
                &self.event_name,
            )),
        });
        manage_route(ctx, handler, &self.mux, dispatch).await
    }
}

struct WebhookHandler {
    route: Arc<Route>,
}

fn pairs_to_json(pairs: Vec<(String, String)>) -> Vec<u8> {
    let map: Map<String, Value> = pairs
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();
    Value::Object(map).to_string().into_bytes()
}

/// Turns a request into the payload to publish.
///
/// Query parameters of a GET and fields of a form POST become a flat JSON
/// object; any other body is passed through untouched.
fn decode_payload(request: &WebhookRequest) -> Result<Vec<u8>, WebhookError> {
    if request.method == Method::GET {
        let pairs: Vec<(String, String)> =
            serde_urlencoded::from_str(request.query.as_deref().unwrap_or(""))
                .map_err(|e| WebhookError::BadRequest(format!("invalid query string: {}", e)))?;
        return Ok(pairs_to_json(pairs));
    }

    let is_form = request
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |ct| ct.starts_with("application/x-www-form-urlencoded"));
    if is_form {
        let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(&request.body)
            .map_err(|e| WebhookError::BadRequest(format!("invalid form body: {}", e)))?;
        return Ok(pairs_to_json(pairs));
    }

    Ok(request.body.to_vec())
}

#[async_trait]
impl RouteHandler for WebhookHandler {
    fn route(&self) -> &Arc<Route> {
        &self.route
    }

    async fn handle(&self, request: WebhookRequest) -> Response {
        match decode_payload(&request) {
            Ok(payload) => self.route.dispatch_event(payload, Vec::new()).await,
            Err(e) => {
                warn!(
                    endpoint = %self.route.context.endpoint,
                    error = ?e,
                    "Failed to decode webhook request"
                );
                e.into_response()
            }
        }
    }
}
