pub mod api;
pub mod config;

pub use self::config::{GithubEventSource, OwnedRepositories};

use crate::connector::Connector;
use crate::eventsource::EventSourceType;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use eventgate::event::{Dispatcher, EventOption};
use eventgate::secrets::SecretStore;
use eventgate::webhook::{
    manage_route, Route, RouteHandler, RouteMultiplexer, WebhookError, WebhookRequest,
};
use hmac::{Hmac, Mac};
use serde_json::{json, Map, Value};
use sha2::Sha256;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use self::api::{GitHubClient, Hook, HookConfig, HookTarget, NewHook};

const EVENT_HEADER: &str = "X-GitHub-Event";
const DELIVERY_HEADER: &str = "X-GitHub-Delivery";
const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

type HmacSha256 = Hmac<Sha256>;

/// GitHub connector: a webhook route that also registers the hook on each
/// configured repository and organization.
pub struct GithubConnector {
    event_source_name: String,
    event_name: String,
    spec: GithubEventSource,
    mux: RouteMultiplexer,
    secrets: SecretStore,
}

impl GithubConnector {
    pub fn new(
        event_source_name: impl Into<String>,
        event_name: impl Into<String>,
        spec: GithubEventSource,
        mux: RouteMultiplexer,
        secrets: SecretStore,
    ) -> Self {
        Self {
            event_source_name: event_source_name.into(),
            event_name: event_name.into(),
            spec,
            mux,
            secrets,
        }
    }

    fn client(&self) -> Result<Option<GitHubClient>> {
        let Some(selector) = self.spec.api_token.as_ref().filter(|_| self.spec.needs_hooks()) else {
            return Ok(None);
        };
        let token = self
            .secrets
            .read(selector)
            .context("failed to retrieve api token")?;
        let client = match &self.spec.github_base_url {
            Some(base_url) => GitHubClient::with_base_url(token, base_url.clone())?,
            None => GitHubClient::new(token)?,
        };
        Ok(Some(client))
    }

    fn webhook_secret(&self) -> Result<Option<String>> {
        self.spec
            .webhook_secret
            .as_ref()
            .map(|selector| {
                self.secrets
                    .read(selector)
                    .context("failed to retrieve webhook secret")
            })
            .transpose()
    }
}

#[async_trait]
impl Connector for GithubConnector {
    fn event_name(&self) -> &str {
        &self.event_name
    }

    fn event_source_name(&self) -> &str {
        &self.event_source_name
    }

    fn event_source_type(&self) -> EventSourceType {
        EventSourceType::Github
    }

    async fn validate(&self) -> Result<()> {
        self.spec.validate()
    }

    async fn listen(&self, ctx: CancellationToken, dispatch: Arc<dyn Dispatcher>) -> Result<()> {
        info!(
            event_source = %self.event_source_name,
            event_name = %self.event_name,
            "Started processing the GitHub event source"
        );
        let handler = Arc::new(GithubHandler {
            route: Arc::new(Route::new(
                self.spec.webhook.clone(),
                &self.event_source_name,
                &self.event_name,
            )),
            spec: self.spec.clone(),
            client: self.client()?,
            secret: self.webhook_secret()?,
            hook_ids: Mutex::new(HashMap::new()),
        });
        manage_route(ctx, handler, &self.mux, dispatch).await
    }
}

struct GithubHandler {
    route: Arc<Route>,
    spec: GithubEventSource,
    client: Option<GitHubClient>,
    secret: Option<String>,
    /// Hook id per target, filled by `post_activate`
    hook_ids: Mutex<HashMap<HookTarget, u64>>,
}

impl GithubHandler {
    fn targets(&self) -> impl Iterator<Item = HookTarget> + '_ {
        let repositories = self.spec.repositories.iter().flat_map(|r| {
            r.names
                .iter()
                .map(move |name| HookTarget::repository(&r.owner, name))
        });
        let organizations = self
            .spec
            .organizations
            .iter()
            .map(|org| HookTarget::Organization(org.clone()));
        repositories.chain(organizations)
    }

    fn record_hook(&self, target: HookTarget, id: u64) {
        self.hook_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(target, id);
    }

    fn hook_id(&self, target: &HookTarget) -> Option<u64> {
        self.hook_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(target)
            .copied()
    }

    fn hook_config(&self) -> HookConfig {
        HookConfig {
            url: Some(self.spec.webhook.public_url()),
            content_type: Some(self.spec.content_type.clone()),
            insecure_ssl: Some(if self.spec.insecure { "1" } else { "0" }.to_string()),
            secret: self.secret.clone(),
        }
    }

    async fn ensure_hook(&self, client: &GitHubClient, target: &HookTarget) -> Result<u64> {
        let url = self.spec.webhook.public_url();
        let hooks = client.list_hooks(target).await?;
        if let Some(hook) = matching_hook(&hooks, &url, &self.spec.events) {
            info!(target = %target, hook_id = hook.id, "Reusing existing GitHub hook");
            return Ok(hook.id);
        }

        info!(target = %target, "Hook not found, creating");
        let hook = NewHook::web(self.spec.events.clone(), self.spec.active, self.hook_config());
        let created = client.create_hook(target, &hook).await?;
        Ok(created.id)
    }
}

/// Existing hook delivering to `url` and subscribed to every one of `events`.
fn matching_hook<'a>(hooks: &'a [Hook], url: &str, events: &[String]) -> Option<&'a Hook> {
    hooks.iter().find(|hook| {
        hook.config.url.as_deref() == Some(url) && events.iter().all(|e| hook.events.contains(e))
    })
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        map.entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    map
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// Checks the `X-Hub-Signature-256` header, `sha256=<hex>` of the HMAC-SHA256
/// of the raw body keyed with the shared secret.
fn verify_signature(secret: &str, headers: &HeaderMap, body: &[u8]) -> Result<(), WebhookError> {
    let signature = header_str(headers, SIGNATURE_HEADER);
    if signature.is_empty() {
        return Err(WebhookError::BadRequest("missing signature header".into()));
    }
    let digest = signature
        .strip_prefix("sha256=")
        .and_then(|hex_digest| hex::decode(hex_digest).ok())
        .ok_or_else(|| WebhookError::BadRequest("malformed signature header".into()))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| WebhookError::BadRequest(format!("unusable webhook secret: {}", e)))?;
    mac.update(body);
    mac.verify_slice(&digest)
        .map_err(|_| WebhookError::BadRequest("payload signature does not match".into()))
}

/// Builds the published payload `{headers, body, metadata}` from a delivery.
///
/// The event and delivery headers are copied into the body; a non-empty
/// delivery id becomes the event id.
fn build_payload(
    request: &WebhookRequest,
    metadata: &BTreeMap<String, String>,
) -> Result<(Vec<u8>, Vec<EventOption>), WebhookError> {
    let is_form = header_str(&request.headers, header::CONTENT_TYPE.as_str())
        .starts_with("application/x-www-form-urlencoded");
    let raw = if is_form {
        let fields: HashMap<String, String> = serde_urlencoded::from_bytes(&request.body)
            .map_err(|e| WebhookError::BadRequest(format!("invalid form body: {}", e)))?;
        fields
            .get("payload")
            .cloned()
            .ok_or_else(|| WebhookError::BadRequest("form body has no payload field".into()))?
            .into_bytes()
    } else {
        request.body.to_vec()
    };

    let mut body: Map<String, Value> = serde_json::from_slice(&raw)
        .map_err(|e| WebhookError::BadRequest(format!("invalid event body: {}", e)))?;
    let delivery = header_str(&request.headers, DELIVERY_HEADER).to_string();
    body.insert(
        EVENT_HEADER.to_string(),
        Value::String(header_str(&request.headers, EVENT_HEADER).to_string()),
    );
    body.insert(DELIVERY_HEADER.to_string(), Value::String(delivery.clone()));

    let event = json!({
        "headers": header_map(&request.headers),
        "body": body,
        "metadata": metadata,
    });
    let options = if delivery.is_empty() {
        Vec::new()
    } else {
        vec![EventOption::Id(delivery)]
    };
    Ok((event.to_string().into_bytes(), options))
}

#[async_trait]
impl RouteHandler for GithubHandler {
    fn route(&self) -> &Arc<Route> {
        &self.route
    }

    async fn handle(&self, request: WebhookRequest) -> Response {
        let verified = match &self.secret {
            Some(secret) => verify_signature(secret, &request.headers, &request.body),
            None => Ok(()),
        };
        match verified.and_then(|_| build_payload(&request, &self.spec.metadata)) {
            Ok((payload, options)) => self.route.dispatch_event(payload, options).await,
            Err(e) => {
                warn!(
                    endpoint = %self.route.context.endpoint,
                    error = ?e,
                    "Request is not a valid GitHub delivery, discarding it"
                );
                e.into_response()
            }
        }
    }

    /// Registers the hook on every repository and organization. A target
    /// that fails is logged and skipped.
    async fn post_activate(&self) -> Result<()> {
        let Some(client) = &self.client else {
            info!(event_name = %self.route.event_name, "No need to create GitHub hooks");
            return Ok(());
        };
        for target in self.targets() {
            match self.ensure_hook(client, &target).await {
                Ok(id) => self.record_hook(target, id),
                Err(e) => error!(target = %target, error = %e, "Failed to set up GitHub hook"),
            }
        }
        Ok(())
    }

    /// Deletes the registered hooks when asked to. Every target is tried;
    /// the failures are reported together at the end.
    async fn post_inactivate(&self) -> Result<()> {
        let Some(client) = &self.client else {
            return Ok(());
        };
        if !self.spec.delete_hook_on_finish {
            return Ok(());
        }
        info!("Deleting GitHub hooks");
        let mut failed = Vec::new();
        for target in self.targets() {
            let Some(id) = self.hook_id(&target) else {
                warn!(target = %target, "Can not find hook id, skipping its deletion");
                continue;
            };
            match client.delete_hook(&target, id).await {
                Ok(()) => info!(target = %target, hook_id = id, "GitHub hook deleted"),
                Err(e) => {
                    error!(target = %target, hook_id = id, error = %e, "Failed to delete GitHub hook");
                    failed.push(target.to_string());
                }
            }
        }
        if !failed.is_empty() {
            bail!("failed to delete hooks for {}", failed.join(", "));
        }
        Ok(())
    }
}
