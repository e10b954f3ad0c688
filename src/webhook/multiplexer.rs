use super::error::WebhookError;
use super::{RouteHandler, WebhookContext, WebhookRequest};
use crate::auth::{mask_authorization, verify_bearer_token, TokenError};
use crate::secrets::SecretStore;
use anyhow::{anyhow, bail, Context, Result};
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type RouteTable = Arc<RwLock<HashMap<String, Arc<dyn RouteHandler>>>>;

const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(5);

struct ActivateCommand {
    handler: Arc<dyn RouteHandler>,
    reply: oneshot::Sender<Result<()>>,
}

/// HTTP listener bound to one port, serving every route on it.
struct PortListener {
    routes: RouteTable,
    local_addr: SocketAddr,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

struct MuxState {
    listeners: Mutex<HashMap<u16, PortListener>>,
    secrets: SecretStore,
    shutdown: CancellationToken,
}

/// Shares HTTP listeners between webhook routes.
///
/// Exactly one listener exists per port; routes on the same port are told
/// apart by path. Activation requests are serialized through a single
/// coordinator task, so two routes racing for a new port never bind twice.
#[derive(Clone)]
pub struct RouteMultiplexer {
    commands: mpsc::Sender<ActivateCommand>,
    state: Arc<MuxState>,
}

impl RouteMultiplexer {
    /// Starts the coordinator task. Must be called within a Tokio runtime.
    pub fn new(secrets: SecretStore) -> Self {
        let state = Arc::new(MuxState {
            listeners: Mutex::new(HashMap::new()),
            secrets,
            shutdown: CancellationToken::new(),
        });
        let (commands, mut rx) = mpsc::channel::<ActivateCommand>(32);

        let coordinator = state.clone();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let result = activate(&coordinator, command.handler).await;
                let _ = command.reply.send(result);
            }
            debug!("Webhook coordinator stopped");
        });

        Self { commands, state }
    }

    /// Registers the handler's route and marks it active, binding the port
    /// first if no listener serves it yet.
    pub async fn activate(&self, handler: Arc<dyn RouteHandler>) -> Result<()> {
        let (reply, result) = oneshot::channel();
        self.commands
            .send(ActivateCommand { handler, reply })
            .await
            .map_err(|_| anyhow!("webhook coordinator is not running"))?;
        result
            .await
            .map_err(|_| anyhow!("webhook coordinator dropped the activation request"))?
    }

    /// Address the listener for `port` is bound to.
    pub async fn local_addr(&self, port: u16) -> Option<SocketAddr> {
        self.state
            .listeners
            .lock()
            .await
            .get(&port)
            .map(|l| l.local_addr)
    }

    pub async fn listener_count(&self) -> usize {
        self.state.listeners.lock().await.len()
    }

    /// Stops every listener and waits for them to finish.
    pub async fn shutdown(&self) {
        self.state.shutdown.cancel();
        let listeners: Vec<(u16, PortListener)> =
            self.state.listeners.lock().await.drain().collect();
        for (port, listener) in listeners {
            listener.stop.cancel();
            if let Err(e) = listener.task.await {
                warn!(port, error = %e, "Webhook listener task failed");
            }
            info!(port, "Webhook listener stopped");
        }
    }
}

async fn activate(state: &MuxState, handler: Arc<dyn RouteHandler>) -> Result<()> {
    let route = handler.route().clone();
    let context = &route.context;

    if state.shutdown.is_cancelled() {
        bail!("webhook multiplexer is shut down");
    }

    let token = match &context.auth_secret {
        Some(selector) => Some(
            state
                .secrets
                .read(selector)
                .context("Failed to read webhook auth secret")?,
        ),
        None => None,
    };
    route.set_auth_token(token);

    let mut listeners = state.listeners.lock().await;
    let listener = match listeners.entry(context.port) {
        Entry::Occupied(entry) => entry.into_mut(),
        Entry::Vacant(entry) => entry.insert(bind(state, context).await?),
    };

    {
        let mut routes = listener.routes.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = routes.get(&context.endpoint) {
            let held = existing.route();
            if !Arc::ptr_eq(held, &route) && held.is_active() {
                bail!(
                    "endpoint {} on port {} is already served by {}/{}",
                    context.endpoint,
                    context.port,
                    held.event_source_name,
                    held.event_name
                );
            }
        }
        routes.insert(context.endpoint.clone(), handler.clone());
    }

    route.set_active(true);
    info!(
        port = context.port,
        endpoint = %context.endpoint,
        event_source = %route.event_source_name,
        event_name = %route.event_name,
        "Route activated"
    );
    Ok(())
}

async fn bind(state: &MuxState, context: &WebhookContext) -> Result<PortListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], context.port));
    let std_listener = std::net::TcpListener::bind(addr)
        .with_context(|| format!("Failed to bind webhook listener on port {}", context.port))?;
    std_listener.set_nonblocking(true)?;
    let local_addr = std_listener.local_addr()?;

    let routes: RouteTable = Arc::new(RwLock::new(HashMap::new()));
    let app = router(routes.clone());
    let stop = state.shutdown.child_token();

    let task = match (&context.server_cert_secret, &context.server_key_secret) {
        (Some(cert), Some(key)) => {
            let tls = RustlsConfig::from_pem_file(state.secrets.path_of(cert)?, state.secrets.path_of(key)?)
                .await
                .context("Failed to load webhook TLS certificate")?;

            let handle = axum_server::Handle::new();
            let server = axum_server::from_tcp_rustls(std_listener, tls).handle(handle.clone());
            let signal = stop.clone();
            tokio::spawn(async move {
                signal.cancelled().await;
                handle.graceful_shutdown(Some(GRACEFUL_SHUTDOWN));
            });

            let port = context.port;
            tokio::spawn(async move {
                if let Err(e) = server.serve(app.into_make_service()).await {
                    error!(port, error = %e, "Webhook TLS listener failed");
                }
            })
        }
        _ => {
            let listener = tokio::net::TcpListener::from_std(std_listener)?;
            let signal = stop.clone();
            let port = context.port;
            tokio::spawn(async move {
                let shutdown = async move { signal.cancelled().await };
                if let Err(e) = axum::serve(listener, app)
                    .with_graceful_shutdown(shutdown)
                    .await
                {
                    error!(port, error = %e, "Webhook listener failed");
                }
            })
        }
    };

    info!(
        port = context.port,
        addr = %local_addr,
        tls = context.tls_enabled(),
        "Webhook listener started"
    );

    Ok(PortListener {
        routes,
        local_addr,
        stop,
        task,
    })
}

fn router(routes: RouteTable) -> Router {
    Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .fallback(serve_route)
        .with_state(routes)
}

/// Fallback handler: looks the request path up in the port's route table
async fn serve_route(
    State(routes): State<RouteTable>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let handler = routes
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .get(uri.path())
        .cloned();

    match handle_request(handler, method, uri, headers, body).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn handle_request(
    handler: Option<Arc<dyn RouteHandler>>,
    method: Method,
    uri: Uri,
    mut headers: HeaderMap,
    body: Body,
) -> Result<Response, WebhookError> {
    let handler = handler.ok_or(WebhookError::NotFound)?;
    let route = handler.route();
    let context = &route.context;

    if !route.is_active() {
        info!(endpoint = %context.endpoint, port = context.port, "Endpoint is not active");
        return Err(WebhookError::Inactive);
    }

    if !context.accepts(&method) {
        return Err(WebhookError::MethodNotAllowed);
    }

    if let Some(expected) = route.auth_token() {
        verify_bearer_token(&headers, &expected).map_err(|e| {
            warn!(endpoint = %context.endpoint, error = %e, "Rejected webhook request");
            match e {
                TokenError::Missing => WebhookError::Unauthorized(e.to_string()),
                _ => WebhookError::Unauthorized(TokenError::Mismatch.to_string()),
            }
        })?;
    }
    mask_authorization(&mut headers);

    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.map_or(false, |len| len > context.max_payload_size) {
        return Err(WebhookError::PayloadTooLarge);
    }
    let body = axum::body::to_bytes(body, context.max_payload_size)
        .await
        .map_err(|_| WebhookError::PayloadTooLarge)?;

    debug!(
        endpoint = %context.endpoint,
        event_source = %route.event_source_name,
        event_name = %route.event_name,
        bytes = body.len(),
        "Received webhook request"
    );

    let request = WebhookRequest {
        method,
        headers,
        query: uri.query().map(str::to_string),
        body,
    };
    Ok(handler.handle(request).await)
}
