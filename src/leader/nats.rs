use super::LeaseStore;
use anyhow::{Context, Result};
use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

/// Lease kept in a JetStream key-value bucket.
///
/// The bucket keeps one revision per key and expires entries after the lease
/// TTL, so a holder that stops renewing loses the lease.
pub struct NatsLeaseStore {
    kv: kv::Store,
}

/// Bucket names only allow `[A-Za-z0-9_-]`.
pub(crate) fn bucket_name(cluster_name: &str) -> String {
    cluster_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

impl NatsLeaseStore {
    pub async fn connect(client: async_nats::Client, cluster_name: &str, ttl: Duration) -> Result<Self> {
        let jetstream = jetstream::new(client);
        let bucket = bucket_name(cluster_name);

        let kv = match jetstream.get_key_value(&bucket).await {
            Ok(kv) => kv,
            Err(_) => {
                info!(bucket = %bucket, "Creating leader election bucket");
                jetstream
                    .create_key_value(kv::Config {
                        bucket: bucket.clone(),
                        history: 1,
                        max_age: ttl,
                        ..Default::default()
                    })
                    .await
                    .with_context(|| format!("Failed to create lease bucket '{}'", bucket))?
            }
        };

        Ok(Self { kv })
    }
}

#[async_trait]
impl LeaseStore for NatsLeaseStore {
    async fn try_acquire(&self, lease: &str, holder: &str) -> Result<Option<u64>> {
        match self.kv.create(lease, holder.to_string().into()).await {
            Ok(revision) => Ok(Some(revision)),
            Err(e) if matches!(e.kind(), kv::CreateErrorKind::AlreadyExists) => {
                let entry = self
                    .kv
                    .entry(lease)
                    .await
                    .context("Failed to read lease")?;
                match entry {
                    // we held it before a restart; take it back
                    Some(entry)
                        if matches!(entry.operation, kv::Operation::Put)
                            && entry.value.as_ref() == holder.as_bytes() =>
                    {
                        let revision = self
                            .kv
                            .update(lease, holder.to_string().into(), entry.revision)
                            .await
                            .context("Failed to reclaim lease")?;
                        Ok(Some(revision))
                    }
                    _ => Ok(None),
                }
            }
            Err(e) => Err(e).context("Failed to create lease"),
        }
    }

    async fn renew(&self, lease: &str, holder: &str, revision: u64) -> Result<u64> {
        self.kv
            .update(lease, holder.to_string().into(), revision)
            .await
            .context("Lease renewal rejected")
    }

    async fn release(&self, lease: &str) -> Result<()> {
        self.kv.delete(lease).await.context("Failed to delete lease")
    }
}
