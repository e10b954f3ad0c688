use super::error::{success, WebhookError};
use super::WebhookContext;
use crate::event::EventOption;
use axum::response::{IntoResponse, Response};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// Pending request waiting for the drain task to publish it.
pub struct DispatchRequest {
    pub payload: Vec<u8>,
    pub options: Vec<EventOption>,
    pub reply: oneshot::Sender<bool>,
}

/// One webhook endpoint and its activation state.
///
/// Requests reach the route through the multiplexer; the connector handler
/// decodes them and hands the payload to [`Route::dispatch_event`], which
/// waits for the drain task's verdict.
pub struct Route {
    pub context: WebhookContext,
    pub event_source_name: String,
    pub event_name: String,
    active: AtomicBool,
    sender: RwLock<Option<mpsc::Sender<DispatchRequest>>>,
    auth_token: RwLock<Option<String>>,
}

impl Route {
    pub fn new(
        context: WebhookContext,
        event_source_name: impl Into<String>,
        event_name: impl Into<String>,
    ) -> Self {
        Self {
            context,
            event_source_name: event_source_name.into(),
            event_name: event_name.into(),
            active: AtomicBool::new(false),
            sender: RwLock::new(None),
            auth_token: RwLock::new(None),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub(crate) fn auth_token(&self) -> Option<String> {
        self.auth_token.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn set_auth_token(&self, token: Option<String>) {
        *self.auth_token.write().unwrap_or_else(|e| e.into_inner()) = token;
    }

    /// Opens the dispatch channel for a new activation.
    pub(crate) fn open_channel(&self, capacity: usize) -> mpsc::Receiver<DispatchRequest> {
        let (tx, rx) = mpsc::channel(capacity);
        *self.sender.write().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        rx
    }

    pub(crate) fn close_channel(&self) {
        self.sender.write().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// Posts `payload` to the drain task and converts the verdict into the
    /// HTTP response: 200 "success" or 500 "failed to record event".
    pub async fn dispatch_event(&self, payload: Vec<u8>, options: Vec<EventOption>) -> Response {
        let sender = self.sender.read().unwrap_or_else(|e| e.into_inner()).clone();
        let Some(sender) = sender else {
            warn!(endpoint = %self.context.endpoint, "Route has no dispatch channel");
            return WebhookError::RecordFailed.into_response();
        };

        let (reply, verdict) = oneshot::channel();
        let request = DispatchRequest {
            payload,
            options,
            reply,
        };
        if sender.send(request).await.is_err() {
            warn!(endpoint = %self.context.endpoint, "Dispatch channel closed");
            return WebhookError::RecordFailed.into_response();
        }

        match verdict.await {
            Ok(true) => success(),
            _ => WebhookError::RecordFailed.into_response(),
        }
    }
}
