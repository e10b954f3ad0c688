//! Event bus seam.
//!
//! The supervisor talks to the bus only through [`EventBusDriver`] and
//! [`EventBusConnection`]; the NATS JetStream implementation lives in
//! [`crate::nats`].

use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, RwLock};

/// Identity headers attached to every bus message.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageHeader {
    pub event_source_name: String,
    pub event_name: String,
    /// Envelope id, used by the bus for deduplication
    pub id: String,
}

/// A serialized envelope plus routing headers.
#[derive(Clone, Debug, PartialEq)]
pub struct BusMessage {
    pub header: MessageHeader,
    pub body: Vec<u8>,
}

/// Opens connections to the bus.
#[async_trait]
pub trait EventBusDriver: Send + Sync {
    /// Connects with the given client id. Each call yields a fresh connection.
    async fn connect(&self, client_id: &str) -> Result<Arc<dyn EventBusConnection>>;
}

/// One live bus session.
#[async_trait]
pub trait EventBusConnection: Send + Sync {
    async fn publish(&self, message: &BusMessage) -> Result<()>;

    /// Cheap, local check; never touches the network.
    fn is_closed(&self) -> bool;

    async fn close(&self);
}

/// Bus connection shared by every connector task.
///
/// Many readers take a snapshot with [`SharedConnection::current`]; only the
/// reconnect daemon swaps it. A snapshot may close after it was taken, so
/// publishers must still handle publish errors.
#[derive(Clone, Default)]
pub struct SharedConnection {
    inner: Arc<RwLock<Option<Arc<dyn EventBusConnection>>>>,
}

impl SharedConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current connection, if one is set and still open.
    pub fn current(&self) -> Option<Arc<dyn EventBusConnection>> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().filter(|c| !c.is_closed()).cloned()
    }

    /// True if there is no connection or the current one reports closed.
    pub fn is_unavailable(&self) -> bool {
        self.current().is_none()
    }

    /// Installs a new connection and returns the previous one.
    pub fn replace(&self, connection: Arc<dyn EventBusConnection>) -> Option<Arc<dyn EventBusConnection>> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.replace(connection)
    }

    /// Removes the connection, leaving the handle unavailable.
    pub fn take(&self) -> Option<Arc<dyn EventBusConnection>> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlagConnection {
        closed: AtomicBool,
    }

    #[async_trait]
    impl EventBusConnection for FlagConnection {
        async fn publish(&self, _message: &BusMessage) -> Result<()> {
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_shared_connection_tracks_closed_state() {
        let shared = SharedConnection::new();
        assert!(shared.is_unavailable());

        let conn = Arc::new(FlagConnection {
            closed: AtomicBool::new(false),
        });
        assert!(shared.replace(conn.clone()).is_none());
        assert!(!shared.is_unavailable());

        conn.close().await;
        assert!(shared.is_unavailable());
        assert!(shared.current().is_none());

        assert!(shared.take().is_some());
        assert!(shared.take().is_none());
    }
}
