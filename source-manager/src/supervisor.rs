//! Listener supervisor - Runs every connector of one event source.
//!
//! Owns the bus connection and its reconnect daemon, launches one
//! supervised task per valid connector and tears everything down in order
//! on cancellation.

use crate::connector::Connector;
use crate::registry::ConnectorSet;
use crate::runners::{reconnect, reconnect_daemon, BusDispatcher};
use anyhow::{bail, Context, Result};
use eventgate::bus::{EventBusDriver, SharedConnection};
use eventgate::config::SupervisorConfig;
use eventgate::event::{is_bus_unavailable, Dispatcher};
use eventgate::filter::EventFilter;
use eventgate::leader::{Elector, LeaderCallbacks};
use eventgate::metrics::EventMetrics;
use eventgate::retry::{retry_charged, Backoff, Charge};
use eventgate::webhook::RouteMultiplexer;
use futures::future::join_all;
use futures::FutureExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Runs the connectors of one event source.
///
/// # Responsibilities
/// - Decide between running directly and running under leader election
/// - Connect to the event bus and keep the connection alive
/// - Validate each connector and compile its filter
/// - Supervise each connector's listen loop with the connector backoff
/// - Graceful shutdown
pub struct Supervisor {
    event_source_name: String,
    namespace: String,
    connectors: ConnectorSet,
    config: SupervisorConfig,
    driver: Arc<dyn EventBusDriver>,
    mux: RouteMultiplexer,
    elector: Option<Arc<dyn Elector>>,
    hostname: String,
    metrics: EventMetrics,
}

impl Supervisor {
    pub fn new(
        event_source_name: impl Into<String>,
        namespace: impl Into<String>,
        connectors: ConnectorSet,
        config: SupervisorConfig,
        driver: Arc<dyn EventBusDriver>,
        mux: RouteMultiplexer,
    ) -> Self {
        Self {
            event_source_name: event_source_name.into(),
            namespace: namespace.into(),
            connectors,
            config,
            driver,
            mux,
            elector: None,
            hostname: "localhost".to_string(),
            metrics: EventMetrics::new(),
        }
    }

    pub fn with_elector(mut self, elector: Arc<dyn Elector>) -> Self {
        self.elector = Some(elector);
        self
    }

    /// Hostname used to derive bus client ids.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn metrics(&self) -> &EventMetrics {
        &self.metrics
    }

    pub fn needs_leader_election(&self) -> bool {
        self.connectors.needs_leader_election()
    }

    /// Runs the event source until `ctx` is cancelled.
    ///
    /// Sources with a connector type that must not run on several replicas
    /// only run while this process holds the lease; losing it ends `start`
    /// with an error.
    pub async fn start(self: Arc<Self>, ctx: CancellationToken) -> Result<()> {
        if !self.needs_leader_election() {
            return self.run(ctx).await;
        }

        let Some(elector) = self.elector.clone() else {
            bail!(
                "event source {}/{} needs leader election but no elector is configured",
                self.namespace,
                self.event_source_name
            );
        };
        info!(
            event_source = %self.event_source_name,
            namespace = %self.namespace,
            "Starting event source under leader election"
        );

        let this = Arc::clone(&self);
        let name = self.event_source_name.clone();
        let callbacks = LeaderCallbacks {
            on_started_leading: Box::new(move |leading| {
                async move { this.run(leading).await }.boxed()
            }),
            on_stopped_leading: Box::new(move || {
                info!(event_source = %name, "Stopped leading, event source no longer running");
            }),
        };
        elector.run_or_die(ctx, callbacks).await
    }

    /// Validates `connector` and compiles the filter declared for it.
    async fn prepare(&self, connector: &dyn Connector) -> Result<Option<EventFilter>> {
        connector.validate().await?;
        self.connectors
            .filter_for(connector.event_name())
            .map(|f| EventFilter::parse(&f.expression))
            .transpose()
            .context("invalid filter")
    }

    /// Runs every valid connector until cancellation.
    ///
    /// Fails with "no active event server running" if every connector task
    /// ends on its own.
    pub async fn run(&self, ctx: CancellationToken) -> Result<()> {
        let ctx = ctx.child_token();
        info!(
            event_source = %self.event_source_name,
            connectors = self.connectors.len(),
            "Starting event source server"
        );

        let connection = SharedConnection::new();
        let initial = reconnect::connect(self.driver.as_ref(), &self.hostname)
            .await
            .context("failed to connect to the event bus")?;
        connection.replace(initial);

        let daemon = tokio::spawn(reconnect_daemon(
            ctx.clone(),
            Arc::clone(&self.driver),
            connection.clone(),
            self.config.reconnect_interval(),
            self.hostname.clone(),
        ));

        let mut tasks = Vec::new();
        for connector in &self.connectors.connectors {
            let filter = match self.prepare(connector.as_ref()).await {
                Ok(filter) => filter,
                Err(e) => {
                    error!(
                        event_source = %connector.event_source_name(),
                        event_name = %connector.event_name(),
                        event_type = %connector.event_source_type(),
                        error = %format!("{:#}", e),
                        "Invalid event source, skipping it"
                    );
                    continue;
                }
            };
            let dispatcher: Arc<dyn Dispatcher> = Arc::new(BusDispatcher::new(
                connector.event_source_name(),
                connector.event_name(),
                connector.event_source_type(),
                filter,
                connection.clone(),
                self.metrics.clone(),
            ));
            tasks.push(tokio::spawn(supervise(
                ctx.clone(),
                Arc::clone(connector),
                dispatcher,
                self.config.connector_backoff.clone(),
                self.metrics.clone(),
            )));
        }
        info!(
            event_source = %self.event_source_name,
            listeners = tasks.len(),
            "Started event source listeners"
        );

        let mut all_done = std::pin::pin!(join_all(tasks));
        let joined = tokio::select! {
            _ = ctx.cancelled() => None,
            results = &mut all_done => Some(results),
        };

        info!(event_source = %self.event_source_name, "Shutting down event source server");
        ctx.cancel();
        let ended_on_their_own = joined.is_some();
        let results = match joined {
            Some(results) => results,
            None => all_done.await,
        };
        for result in results {
            if let Err(e) = result {
                error!(error = %e, "Listener task panicked");
            }
        }
        if let Err(e) = daemon.await {
            error!(error = %e, "Reconnect daemon panicked");
        }
        if let Some(conn) = connection.take() {
            conn.close().await;
        }
        self.mux.shutdown().await;

        if ended_on_their_own {
            error!(event_source = %self.event_source_name, "No active event server running");
            bail!("no active event server running");
        }
        info!(event_source = %self.event_source_name, "Event source server stopped");
        Ok(())
    }
}

/// Runs `connector.listen` under `backoff` until it returns cleanly or the
/// budget is spent. Cancelling `ctx` also ends a pending backoff. Bus
/// outages do not consume steps.
async fn supervise(
    ctx: CancellationToken,
    connector: Arc<dyn Connector>,
    dispatcher: Arc<dyn Dispatcher>,
    backoff: Backoff,
    metrics: EventMetrics,
) {
    let source = connector.event_source_name().to_string();
    let name = connector.event_name().to_string();
    let _running = metrics.service_started(&source, &name);
    info!(event_source = %source, event_name = %name, "Starting event source listener");

    let result = retry_charged(
        Some(&backoff),
        Some(&ctx),
        || {
            let ctx = ctx.clone();
            let connector = Arc::clone(&connector);
            let dispatcher = Arc::clone(&dispatcher);
            async move {
                if ctx.is_cancelled() {
                    return Ok(());
                }
                connector.listen(ctx, dispatcher).await
            }
        },
        |e| {
            if is_bus_unavailable(e) {
                warn!(event_source = %source, event_name = %name, error = %e, "Event bus unavailable, restarting listener");
                Charge::Free
            } else {
                warn!(event_source = %source, event_name = %name, error = %format!("{:#}", e), "Listener failed, retrying");
                Charge::Step
            }
        },
    )
    .await;

    match result {
        Ok(()) => info!(event_source = %source, event_name = %name, "Event source listener stopped"),
        Err(e) if e.cancelled => info!(
            event_source = %source,
            event_name = %name,
            "Event source listener stopped while backing off"
        ),
        Err(e) => error!(
            event_source = %source,
            event_name = %name,
            attempts = e.attempts,
            error = %format!("{:#}", e.last),
            "Failed to start listening, giving up"
        ),
    }
}
