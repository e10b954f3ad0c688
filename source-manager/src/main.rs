use anyhow::{Context, Result};
use eventgate::config::config_path;
use eventgate::leader::new_nats_elector;
use eventgate::nats::JetStreamDriver;
use eventgate::secrets::SecretStore;
use eventgate::webhook::RouteMultiplexer;
use source_manager::{build_connectors, ManagerConfig, Supervisor};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "eventgate=info,source_manager=info".into()),
        )
        .init();

    info!("Source Manager starting...");

    let path = config_path();
    let config = ManagerConfig::load(&path)?;
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let source = &config.eventsource;

    info!(
        config = %path,
        event_source = %source.name,
        namespace = %source.namespace,
        nats_url = %config.gateway.nats.url,
        hostname = %hostname,
        "Configuration loaded"
    );

    let secrets = SecretStore::from_config(&config.gateway.secrets);
    let mux = RouteMultiplexer::new(secrets.clone());
    let connectors = build_connectors(source, &mux, &secrets)?;
    let driver = Arc::new(JetStreamDriver::new(config.gateway.nats.clone()));

    let mut supervisor = Supervisor::new(
        &source.name,
        &source.namespace,
        connectors,
        config.gateway.supervisor.clone(),
        driver,
        mux,
    )
    .with_hostname(&hostname);

    if supervisor.needs_leader_election() {
        let client = async_nats::connect(config.gateway.nats.url.as_str())
            .await
            .context("Failed to connect to NATS for leader election")?;
        let elector = new_nats_elector(
            client,
            &source.namespace,
            &source.name,
            &hostname,
            &config.gateway.leader,
        )
        .await
        .context("Failed to create leader elector")?;
        supervisor = supervisor.with_elector(Arc::new(elector));
    }

    // Cancel everything on ctrl_c
    let ctx = CancellationToken::new();
    let shutdown = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    Arc::new(supervisor).start(ctx).await?;
    info!("Source Manager stopped");

    Ok(())
}
