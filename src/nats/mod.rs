// NATS JetStream implementation of the event bus

mod client;
mod publisher;

pub use client::{JetStreamDriver, NatsConfig};
pub use publisher::JetStreamConnection;
