// Backoff and retry
pub mod retry;

// Event envelope and the dispatch seam connectors publish through
pub mod event;

// Payload filter expressions
pub mod filter;

// Event bus abstraction
pub mod bus;

// NATS JetStream bus implementation
pub mod nats;

// Leader election
pub mod leader;

// Shared webhook HTTP ingress
pub mod webhook;

// Bearer token checks
pub mod auth;

// Mounted secrets
pub mod secrets;

// Per-event delivery counters
pub mod metrics;

// Configuration
pub mod config;
