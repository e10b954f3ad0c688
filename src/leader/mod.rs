//! Leader election.
//!
//! Event sources whose connectors must not run twice (pollers, timers,
//! subscriptions without queue groups) run their work under a distributed
//! lease. [`LeaseElector`] implements the election loop over any
//! [`LeaseStore`]; [`NatsLeaseStore`] keeps the lease in a JetStream
//! key-value bucket whose `max_age` acts as the lease TTL.

mod nats;

#[cfg(test)]
mod tests;

pub use nats::NatsLeaseStore;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Leader election configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LeaderConfig {
    /// Lease expires if not renewed within this window
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_seconds: u64,
    #[serde(default = "default_renew_interval")]
    pub renew_interval_seconds: u64,
    /// How often a follower retries acquiring the lease
    #[serde(default = "default_retry_interval")]
    pub retry_interval_seconds: u64,
}

fn default_lease_ttl() -> u64 {
    15
}

fn default_renew_interval() -> u64 {
    5
}

fn default_retry_interval() -> u64 {
    2
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            lease_ttl_seconds: default_lease_ttl(),
            renew_interval_seconds: default_renew_interval(),
            retry_interval_seconds: default_retry_interval(),
        }
    }
}

impl LeaderConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_seconds.max(1))
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_secs(self.renew_interval_seconds.max(1))
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_seconds.max(1))
    }
}

/// Work started once the lease is held. The token is cancelled when
/// leadership ends.
pub type LeadingFn = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<()>> + Send>;

pub struct LeaderCallbacks {
    pub on_started_leading: LeadingFn,
    pub on_stopped_leading: Box<dyn FnOnce() + Send>,
}

#[async_trait]
pub trait Elector: Send + Sync {
    /// Blocks until `ctx` is cancelled, the leading work finishes, or the
    /// lease is lost.
    ///
    /// Returns `Ok(())` when cancelled, the work's own result when it
    /// finishes, and an error when leadership is lost.
    async fn run_or_die(&self, ctx: CancellationToken, callbacks: LeaderCallbacks) -> Result<()>;
}

/// Storage of a single-holder lease with revision-checked renewal.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Takes `lease` for `holder` if it is free or already held by `holder`.
    /// Returns the new revision, or `None` when another holder owns it.
    async fn try_acquire(&self, lease: &str, holder: &str) -> Result<Option<u64>>;

    /// Extends the lease; fails if the revision moved underneath us.
    async fn renew(&self, lease: &str, holder: &str, revision: u64) -> Result<u64>;

    async fn release(&self, lease: &str) -> Result<()>;
}

/// Cluster name of an event source's leader election group.
pub fn cluster_name(namespace: &str, event_source: &str) -> String {
    format!("{}-eventsource-{}", namespace, event_source)
}

/// Lease key of an event source.
pub fn lease_name(event_source: &str) -> String {
    format!("eventsource-{}", event_source)
}

enum LeadOutcome {
    Finished(Result<()>),
    Cancelled(Result<()>),
    Lost(anyhow::Error),
}

pub struct LeaseElector<S> {
    store: S,
    lease: String,
    identity: String,
    renew_interval: Duration,
    retry_interval: Duration,
}

impl<S: LeaseStore> LeaseElector<S> {
    pub fn new(store: S, lease: impl Into<String>, identity: impl Into<String>, config: &LeaderConfig) -> Self {
        Self {
            store,
            lease: lease.into(),
            identity: identity.into(),
            renew_interval: config.renew_interval(),
            retry_interval: config.retry_interval(),
        }
    }

    /// Overrides the configured renew and retry intervals.
    pub fn with_intervals(mut self, renew: Duration, retry: Duration) -> Self {
        self.renew_interval = renew;
        self.retry_interval = retry;
        self
    }

    /// Waits for the lease. `None` means `ctx` was cancelled first.
    async fn acquire(&self, ctx: &CancellationToken) -> Option<u64> {
        loop {
            match self.store.try_acquire(&self.lease, &self.identity).await {
                Ok(Some(revision)) => return Some(revision),
                Ok(None) => debug!(lease = %self.lease, "Lease held by another candidate"),
                Err(e) => warn!(lease = %self.lease, error = %e, "Failed to acquire lease"),
            }

            tokio::select! {
                _ = ctx.cancelled() => return None,
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        }
    }
}

fn join_result(res: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    res.map_err(|e| anyhow!("leading task failed: {}", e))?
}

#[async_trait]
impl<S: LeaseStore> Elector for LeaseElector<S> {
    async fn run_or_die(&self, ctx: CancellationToken, callbacks: LeaderCallbacks) -> Result<()> {
        let Some(mut revision) = self.acquire(&ctx).await else {
            return Ok(());
        };
        info!(lease = %self.lease, identity = %self.identity, "Became leader");

        let leading = ctx.child_token();
        let mut task = tokio::spawn((callbacks.on_started_leading)(leading.clone()));

        let mut ticker = tokio::time::interval(self.renew_interval);
        ticker.tick().await;

        let outcome = loop {
            tokio::select! {
                res = &mut task => break LeadOutcome::Finished(join_result(res)),
                _ = ctx.cancelled() => {
                    leading.cancel();
                    break LeadOutcome::Cancelled(join_result((&mut task).await));
                }
                _ = ticker.tick() => {
                    match self.store.renew(&self.lease, &self.identity, revision).await {
                        Ok(next) => revision = next,
                        Err(e) => {
                            error!(lease = %self.lease, error = %e, "Failed to renew lease");
                            leading.cancel();
                            if let Err(e) = join_result((&mut task).await) {
                                warn!(error = %e, "Leading task ended with error after lease loss");
                            }
                            break LeadOutcome::Lost(e);
                        }
                    }
                }
            }
        };

        (callbacks.on_stopped_leading)();

        match outcome {
            LeadOutcome::Lost(e) => {
                error!(lease = %self.lease, identity = %self.identity, "Leader lost");
                Err(e.context("leader lost"))
            }
            LeadOutcome::Finished(res) | LeadOutcome::Cancelled(res) => {
                if let Err(e) = self.store.release(&self.lease).await {
                    warn!(lease = %self.lease, error = %e, "Failed to release lease");
                }
                info!(lease = %self.lease, "Stopped leading");
                res
            }
        }
    }
}

/// Builds the JetStream-backed elector for an event source.
pub async fn new_nats_elector(
    client: async_nats::Client,
    namespace: &str,
    event_source: &str,
    identity: &str,
    config: &LeaderConfig,
) -> Result<LeaseElector<NatsLeaseStore>> {
    let store = NatsLeaseStore::connect(client, &cluster_name(namespace, event_source), config.lease_ttl()).await?;
    Ok(LeaseElector::new(store, lease_name(event_source), identity, config))
}
