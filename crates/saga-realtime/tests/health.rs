use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use saga_realtime::health::{AppLifecycle, HealthConfig, HealthMonitor, HealthOutcome, SessionRefresher};
use saga_realtime::memory::MemoryHub;
use saga_realtime::supervisor::{Inbound, InboundHandler};
use saga_realtime::{ChannelRegistry, ConnectionSupervisor, SupervisorConfig};
use saga_types::models::{
    ActionScope, CampaignMessage, CampaignSummary, CharacterLevel, NewMessage, PlayerAction, ReadStatus,
};
use saga_types::store::{BackingStore, StoreError, StoreResult};
use saga_types::subscription::SubscriptionDescriptor;

enum Ping {
    Ok,
    Fail(StoreError),
    Hang,
}

/// A store whose pings follow a script; every other call is unused here.
struct ScriptedStore {
    pings: Mutex<VecDeque<Ping>>,
    calls: AtomicUsize,
}

impl ScriptedStore {
    fn scripted(pings: impl IntoIterator<Item = Ping>) -> Arc<Self> {
        Arc::new(Self {
            pings: Mutex::new(pings.into_iter().collect()),
            calls: AtomicUsize::new(0),
        })
    }
}

impl BackingStore for ScriptedStore {
    fn ping(&self) -> BoxFuture<'_, StoreResult<()>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.pings.lock().unwrap().pop_front().unwrap_or(Ping::Ok);
        Box::pin(async move {
            match next {
                Ping::Ok => Ok(()),
                Ping::Fail(e) => Err(e),
                Ping::Hang => std::future::pending().await,
            }
        })
    }

    fn fetch_history(&self, _: Uuid, _: usize) -> BoxFuture<'_, StoreResult<Vec<CampaignMessage>>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn insert_message(&self, _: NewMessage) -> BoxFuture<'_, StoreResult<CampaignMessage>> {
        Box::pin(async { Err(StoreError::Rejected("read-only".into())) })
    }

    fn fetch_read_status(&self, _: Uuid) -> BoxFuture<'_, StoreResult<Vec<ReadStatus>>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn upsert_read_status(&self, _: ReadStatus) -> BoxFuture<'_, StoreResult<ReadStatus>> {
        Box::pin(async { Err(StoreError::Rejected("read-only".into())) })
    }

    fn fetch_actions(&self, _: ActionScope) -> BoxFuture<'_, StoreResult<Vec<PlayerAction>>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn delete_action(&self, _: Uuid) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async { Err(StoreError::NotFound) })
    }

    fn fetch_characters(&self, _: Uuid) -> BoxFuture<'_, StoreResult<Vec<CharacterLevel>>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn fetch_summaries(&self, _: Uuid) -> BoxFuture<'_, StoreResult<Vec<CampaignSummary>>> {
        Box::pin(async { Ok(Vec::new()) })
    }
}

#[derive(Default)]
struct CountingSession {
    refreshes: AtomicUsize,
    hang: bool,
}

impl SessionRefresher for CountingSession {
    fn refresh(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let hang = self.hang;
        Box::pin(async move {
            if hang {
                std::future::pending::<()>().await;
            }
            Ok(())
        })
    }
}

struct Harness {
    hub: MemoryHub,
    supervisor: ConnectionSupervisor,
    store: Arc<ScriptedStore>,
    session: Arc<CountingSession>,
    monitor: Arc<HealthMonitor>,
}

fn harness(pings: impl IntoIterator<Item = Ping>, session: CountingSession) -> Harness {
    let hub = MemoryHub::new();
    let registry = ChannelRegistry::new();
    let supervisor = ConnectionSupervisor::new(Arc::new(hub.clone()), registry.clone(), SupervisorConfig::default());
    let store = ScriptedStore::scripted(pings);
    let session = Arc::new(session);
    let monitor = Arc::new(HealthMonitor::new(
        store.clone(),
        session.clone(),
        registry,
        HealthConfig::default(),
    ));
    Harness {
        hub,
        supervisor,
        store,
        session,
        monitor,
    }
}

fn ignore() -> InboundHandler {
    Arc::new(|_: Inbound| {})
}

#[tokio::test(start_paused = true)]
async fn healthy_probe_touches_nothing() {
    let h = harness([Ping::Ok], CountingSession::default());
    assert_eq!(h.monitor.check().await, HealthOutcome::Healthy);
    assert_eq!(h.session.refreshes.load(Ordering::SeqCst), 0);
    assert!(!h.monitor.is_checking());
}

#[tokio::test(start_paused = true)]
async fn auth_failure_refreshes_then_reprobes() {
    let h = harness([Ping::Fail(StoreError::Auth("jwt expired".into())), Ping::Ok], CountingSession::default());
    assert_eq!(h.monitor.check().await, HealthOutcome::Recovered);
    assert_eq!(h.session.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn network_failure_retries_without_refreshing() {
    let h = harness([Ping::Fail(StoreError::Network("reset".into())), Ping::Ok], CountingSession::default());
    assert_eq!(h.monitor.check().await, HealthOutcome::Recovered);
    assert_eq!(h.session.refreshes.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn persistent_failure_recreates_every_channel() {
    let h = harness(
        [
            Ping::Fail(StoreError::Network("reset".into())),
            Ping::Fail(StoreError::Network("reset".into())),
        ],
        CountingSession::default(),
    );
    let a = h.supervisor.supervise("a", SubscriptionDescriptor::broadcast_only(), ignore());
    let b = h.supervisor.supervise("b", SubscriptionDescriptor::broadcast_only(), ignore());
    a.wait_subscribed().await.unwrap();
    b.wait_subscribed().await.unwrap();
    assert_eq!(h.hub.open_count(), 2);

    assert_eq!(h.monitor.check().await, HealthOutcome::Reconnected { channels: 2 });

    while h.hub.open_count() < 4 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    a.wait_subscribed().await.unwrap();
    b.wait_subscribed().await.unwrap();
    assert_eq!(h.hub.live_count("a"), 1);
    assert_eq!(h.hub.live_count("b"), 1);
}

#[tokio::test(start_paused = true)]
async fn hung_probe_times_out() {
    let h = harness([Ping::Hang, Ping::Hang], CountingSession::default());
    let started = Instant::now();
    assert_eq!(h.monitor.check().await, HealthOutcome::Reconnected { channels: 0 });
    // Two probes, each cut off at ten seconds.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(20) && elapsed < Duration::from_secs(21), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn overlapping_checks_are_skipped_and_hung_refresh_is_abandoned() {
    let h = harness(
        [Ping::Fail(StoreError::Auth("jwt expired".into()))],
        CountingSession {
            hang: true,
            ..Default::default()
        },
    );

    let monitor = h.monitor.clone();
    let first = tokio::spawn(async move { monitor.check().await });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(h.monitor.is_checking());
    assert_eq!(h.monitor.check().await, HealthOutcome::Skipped);

    assert_eq!(first.await.unwrap(), HealthOutcome::Reconnected { channels: 0 });
    assert!(!h.monitor.is_checking());
    assert_eq!(h.monitor.check().await, HealthOutcome::Healthy);
}

#[tokio::test(start_paused = true)]
async fn short_background_trip_skips_the_probe() {
    let h = harness(std::iter::empty(), CountingSession::default());

    assert_eq!(h.monitor.on_lifecycle(AppLifecycle::Background).await, None);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.monitor.on_lifecycle(AppLifecycle::Foreground).await, None);
    assert_eq!(h.store.calls.load(Ordering::SeqCst), 0);

    h.monitor.on_lifecycle(AppLifecycle::Background).await;
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(
        h.monitor.on_lifecycle(AppLifecycle::Foreground).await,
        Some(HealthOutcome::Healthy)
    );
    assert_eq!(h.store.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn periodic_probe_pauses_in_background() {
    let h = harness(std::iter::empty(), CountingSession::default());
    let (lifecycle, rx) = mpsc::channel(4);
    let cancel = CancellationToken::new();
    let task = h.monitor.clone().spawn(rx, cancel.clone());

    tokio::time::sleep(Duration::from_secs(301)).await;
    assert_eq!(h.store.calls.load(Ordering::SeqCst), 1);

    lifecycle.send(AppLifecycle::Background).await.unwrap();
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.store.calls.load(Ordering::SeqCst), 1);

    // Away for well over the threshold, so returning probes at once.
    lifecycle.send(AppLifecycle::Foreground).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.store.calls.load(Ordering::SeqCst), 2);

    cancel.cancel();
    task.await.unwrap();
}
