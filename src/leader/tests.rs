use super::nats::bucket_name;
use super::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// In-memory lease table shared by several electors.
#[derive(Clone, Default)]
struct MemoryLeases {
    leases: Arc<Mutex<HashMap<String, (String, u64)>>>,
    fail_renewals: Arc<AtomicBool>,
}

#[async_trait]
impl LeaseStore for MemoryLeases {
    async fn try_acquire(&self, lease: &str, holder: &str) -> Result<Option<u64>> {
        let mut leases = self.leases.lock().unwrap();
        match leases.get(lease) {
            Some((owner, _)) if owner != holder => Ok(None),
            Some((_, revision)) => {
                let next = revision + 1;
                leases.insert(lease.to_string(), (holder.to_string(), next));
                Ok(Some(next))
            }
            None => {
                leases.insert(lease.to_string(), (holder.to_string(), 1));
                Ok(Some(1))
            }
        }
    }

    async fn renew(&self, lease: &str, holder: &str, revision: u64) -> Result<u64> {
        if self.fail_renewals.load(Ordering::SeqCst) {
            anyhow::bail!("wrong last sequence");
        }
        let mut leases = self.leases.lock().unwrap();
        match leases.get(lease) {
            Some((owner, current)) if owner == holder && *current == revision => {
                leases.insert(lease.to_string(), (holder.to_string(), revision + 1));
                Ok(revision + 1)
            }
            _ => anyhow::bail!("wrong last sequence"),
        }
    }

    async fn release(&self, lease: &str) -> Result<()> {
        self.leases.lock().unwrap().remove(lease);
        Ok(())
    }
}

fn elector(store: &MemoryLeases, identity: &str) -> LeaseElector<MemoryLeases> {
    LeaseElector::new(store.clone(), "eventsource-demo", identity, &LeaderConfig::default())
        .with_intervals(Duration::from_millis(20), Duration::from_millis(20))
}

fn callbacks(
    started: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    work: impl FnOnce(CancellationToken) -> BoxFuture<'static, Result<()>> + Send + 'static,
) -> LeaderCallbacks {
    LeaderCallbacks {
        on_started_leading: Box::new(move |token| {
            started.store(true, Ordering::SeqCst);
            work(token)
        }),
        on_stopped_leading: Box::new(move || stopped.store(true, Ordering::SeqCst)),
    }
}

fn until_cancelled(token: CancellationToken) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        token.cancelled().await;
        Ok::<(), anyhow::Error>(())
    })
}

#[test]
fn test_names() {
    assert_eq!(cluster_name("argo", "demo"), "argo-eventsource-demo");
    assert_eq!(lease_name("demo"), "eventsource-demo");
    assert_eq!(bucket_name("argo.events-eventsource-demo"), "argo_events-eventsource-demo");
}

#[tokio::test]
async fn test_leader_runs_work_and_releases_on_cancel() {
    let store = MemoryLeases::default();
    let started = Arc::new(AtomicBool::new(false));
    let stopped = Arc::new(AtomicBool::new(false));
    let ctx = CancellationToken::new();

    let cancel = ctx.clone();
    let handle = tokio::spawn({
        let elector = elector(&store, "pod-a");
        let cbs = callbacks(started.clone(), stopped.clone(), until_cancelled);
        async move { elector.run_or_die(cancel, cbs).await }
    });

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(started.load(Ordering::SeqCst));
    assert!(store.leases.lock().unwrap().contains_key("eventsource-demo"));

    ctx.cancel();
    handle.await.unwrap().unwrap();
    assert!(stopped.load(Ordering::SeqCst));
    assert!(store.leases.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_follower_waits_for_lease() {
    let store = MemoryLeases::default();
    store
        .leases
        .lock()
        .unwrap()
        .insert("eventsource-demo".to_string(), ("pod-a".to_string(), 1));

    let started = Arc::new(AtomicBool::new(false));
    let stopped = Arc::new(AtomicBool::new(false));
    let ctx = CancellationToken::new();

    let cancel = ctx.clone();
    let handle = tokio::spawn({
        let elector = elector(&store, "pod-b");
        let cbs = callbacks(started.clone(), stopped.clone(), until_cancelled);
        async move { elector.run_or_die(cancel, cbs).await }
    });

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(!started.load(Ordering::SeqCst));

    // previous holder goes away
    store.leases.lock().unwrap().clear();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(started.load(Ordering::SeqCst));

    ctx.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_cancel_before_acquire_never_leads() {
    let store = MemoryLeases::default();
    store
        .leases
        .lock()
        .unwrap()
        .insert("eventsource-demo".to_string(), ("pod-a".to_string(), 1));

    let started = Arc::new(AtomicBool::new(false));
    let stopped = Arc::new(AtomicBool::new(false));
    let ctx = CancellationToken::new();
    ctx.cancel();

    elector(&store, "pod-b")
        .run_or_die(ctx, callbacks(started.clone(), stopped.clone(), until_cancelled))
        .await
        .unwrap();
    assert!(!started.load(Ordering::SeqCst));
    assert!(!stopped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_lease_loss_cancels_work_and_errors() {
    let store = MemoryLeases::default();
    let started = Arc::new(AtomicBool::new(false));
    let stopped = Arc::new(AtomicBool::new(false));
    let work_cancelled = Arc::new(AtomicBool::new(false));

    let flag = work_cancelled.clone();
    let cbs = callbacks(started.clone(), stopped.clone(), move |token| {
        Box::pin(async move {
            token.cancelled().await;
            flag.store(true, Ordering::SeqCst);
            Ok::<(), anyhow::Error>(())
        })
    });

    let handle = tokio::spawn({
        let elector = elector(&store, "pod-a");
        async move { elector.run_or_die(CancellationToken::new(), cbs).await }
    });

    tokio::time::sleep(Duration::from_millis(60)).await;
    store.fail_renewals.store(true, Ordering::SeqCst);

    let err = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(err.to_string().contains("leader lost"));
    assert!(work_cancelled.load(Ordering::SeqCst));
    assert!(stopped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_work_error_is_returned() {
    let store = MemoryLeases::default();
    let started = Arc::new(AtomicBool::new(false));
    let stopped = Arc::new(AtomicBool::new(false));

    let cbs = callbacks(started, stopped.clone(), |_token| {
        Box::pin(async { Err::<(), _>(anyhow!("no active event server running")) })
    });

    let err = elector(&store, "pod-a")
        .run_or_die(CancellationToken::new(), cbs)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "no active event server running");
    assert!(stopped.load(Ordering::SeqCst));
    assert!(store.leases.lock().unwrap().is_empty());
}
