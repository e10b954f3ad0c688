use super::{EnvelopeError, EventOption};
use async_trait::async_trait;

/// Why a dispatched message did not reach the bus.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The bus connection is absent or closed. Nothing was sent; the
    /// reconnect daemon will restore the connection.
    #[error("event bus unavailable: {0}")]
    BusUnavailable(String),

    /// The bus rejected the message after the inner publish retries.
    #[error("failed to publish event {id}: {reason}")]
    Publish { id: String, reason: String },

    #[error("invalid event: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl DispatchError {
    /// Bus-level failures abort a connector's `listen` loop so the message is
    /// retried; other failures only concern the one message.
    pub fn is_bus_error(&self) -> bool {
        matches!(
            self,
            DispatchError::BusUnavailable(_) | DispatchError::Publish { .. }
        )
    }
}

/// True if `err` was caused by a [`DispatchError::BusUnavailable`].
pub fn is_bus_unavailable(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<DispatchError>(),
            Some(DispatchError::BusUnavailable(_))
        )
    })
}

/// Sink handed to every connector; called once per incoming message.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Filters, wraps and publishes one payload.
    ///
    /// Returns `Ok(())` both when the message was published and when a
    /// filter dropped it.
    async fn dispatch(&self, payload: Vec<u8>, options: &[EventOption]) -> Result<(), DispatchError>;
}
