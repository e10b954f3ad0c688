use crate::eventsource::EventSourceType;
use anyhow::Result;
use async_trait::async_trait;
use eventgate::event::Dispatcher;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One configured event source entry.
///
/// Connectors are built once at startup from the declarative
/// [`EventSource`](crate::eventsource::EventSource) and live for the whole
/// process; they hold no state between runs of [`Connector::listen`].
///
/// # Lifecycle
/// 1. The supervisor calls `validate()`; a failure skips only this connector
/// 2. `listen()` runs under the connector backoff until `ctx` is cancelled or
///    the retry budget is spent
/// 3. Each received message is handed to `dispatch`, which filters, wraps and
///    publishes it
#[async_trait]
pub trait Connector: Send + Sync {
    /// Name of the entry within its event source.
    fn event_name(&self) -> &str;

    fn event_source_name(&self) -> &str;

    fn event_source_type(&self) -> EventSourceType;

    /// Checks the configuration without touching the network.
    async fn validate(&self) -> Result<()>;

    /// Receives events until `ctx` is cancelled.
    ///
    /// Returns `Ok(())` on cancellation. A bus-level dispatch failure should
    /// be returned so the supervisor can retry the connector; failures that
    /// concern a single message are logged and skipped.
    async fn listen(&self, ctx: CancellationToken, dispatch: Arc<dyn Dispatcher>) -> Result<()>;
}
