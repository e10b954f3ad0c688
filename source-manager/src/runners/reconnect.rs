use anyhow::Result;
use eventgate::bus::{EventBusConnection, EventBusDriver, SharedConnection};
use eventgate::retry::{retry, RetryError};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Bus client id for this process: `client-{hostname}-{n}` with dots in the
/// hostname replaced and `n` in `0..1000`.
pub fn client_id(hostname: &str) -> String {
    let n: u32 = rand::thread_rng().gen_range(0..1000);
    format!("client-{}-{}", hostname.replace('.', "_"), n)
}

/// Connects with the default retry policy and a fresh client id.
pub async fn connect(driver: &dyn EventBusDriver, hostname: &str) -> Result<Arc<dyn EventBusConnection>> {
    retry(None, || {
        let id = client_id(hostname);
        async move { driver.connect(&id).await }
    })
    .await
    .map_err(RetryError::into_inner)
}

/// Watches the shared connection and replaces it whenever it is closed.
///
/// Polls every `interval` until `ctx` is cancelled. Failed reconnects are
/// logged and tried again on the next tick.
pub async fn reconnect_daemon(
    ctx: CancellationToken,
    driver: Arc<dyn EventBusDriver>,
    connection: SharedConnection,
    interval: Duration,
    hostname: String,
) {
    info!(interval = ?interval, "Starting event bus reconnect daemon");
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = ctx.cancelled() => {
                info!("Exiting event bus reconnect daemon");
                return;
            }
            _ = ticker.tick() => {}
        }

        if !connection.is_unavailable() {
            continue;
        }
        info!("Event bus connection is closed, reconnecting");
        match connect(driver.as_ref(), &hostname).await {
            Ok(fresh) => {
                if let Some(old) = connection.replace(fresh) {
                    old.close().await;
                }
                info!("Reconnected to the event bus");
            }
            Err(e) => error!(error = %e, "Failed to reconnect to the event bus"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_format() {
        let id = client_id("pod.example.local");
        let prefix = "client-pod_example_local-";
        assert!(id.starts_with(prefix), "{}", id);
        let n: u32 = id[prefix.len()..].parse().unwrap();
        assert!(n < 1000);
    }
}
