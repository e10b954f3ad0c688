//! Source Manager - Runs the connectors of one event source.
//!
//! Reads a declarative [`EventSource`], builds one [`Connector`] per entry
//! and hands them to the [`Supervisor`], which publishes every received
//! message to the event bus as an envelope.
//!
//! # Architecture
//!
//! ```text
//! Webhooks / GitHub / NATS / timers
//!          ↓
//! ┌─────────────────────────────────────────┐
//! │       Connector (implements trait)       │
//! │  - Receive or produce payloads           │
//! │  - Call dispatch per message             │
//! └─────────────────────────────────────────┘
//!          ↓
//! ┌─────────────────────────────────────────┐
//! │       Supervisor                         │
//! │  - Leader election when required         │
//! │  - Bus connection + reconnect daemon     │
//! │  - Filter, envelope, publish             │
//! └─────────────────────────────────────────┘
//!          ↓
//!     NATS JetStream
//! ```
//!
//! # Core Types
//!
//! - [`Connector`] - Trait that all connectors implement
//! - [`EventSource`] - Declarative set of connector entries
//! - [`ConnectorSet`] - Connectors built from an event source, with filters
//! - [`Supervisor`] - Runs a connector set

mod connector;
pub mod config;
pub mod connectors;
pub mod eventsource;
pub mod registry;
pub mod runners;
pub mod supervisor;

// Re-export public types
pub use config::ManagerConfig;
pub use connector::Connector;
pub use eventsource::{EventSource, EventSourceType};
pub use registry::{build_connectors, ConnectorSet};
pub use supervisor::Supervisor;
