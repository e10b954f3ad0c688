//! Per-connector plumbing run by the supervisor.

pub mod publish;
pub mod reconnect;

pub use publish::BusDispatcher;
pub use reconnect::{client_id, reconnect_daemon};
