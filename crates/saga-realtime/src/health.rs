//! Liveness probing for connections the transport never reported as broken,
//! typically sockets that went stale while the app sat in the background.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use saga_types::store::{BackingStore, StoreError};

use crate::registry::ChannelRegistry;

/// Refreshes the authenticated session used by the store and the transport.
pub trait SessionRefresher: Send + Sync {
    fn refresh(&self) -> BoxFuture<'_, Result<(), StoreError>>;
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Hard limit on one probe read.
    pub probe_timeout: Duration,
    /// A probe slower than this counts as failed.
    pub slow_threshold: Duration,
    /// Periodic probe while in the foreground.
    pub interval: Duration,
    /// Returning to the foreground after longer than this triggers a probe.
    pub background_threshold: Duration,
    /// Upper bound on one recovery; clears the in-progress flag even if the
    /// session refresh never returns.
    pub recovery_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(10),
            slow_threshold: Duration::from_secs(15),
            interval: Duration::from_secs(5 * 60),
            background_threshold: Duration::from_secs(30),
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppLifecycle {
    Foreground,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    Healthy,
    /// The first probe failed but a refresh or retry brought it back.
    Recovered,
    /// Still failing; every registered channel was asked to reconnect.
    Reconnected { channels: usize },
    /// Another check was already running.
    Skipped,
}

pub struct HealthMonitor {
    store: Arc<dyn BackingStore>,
    session: Arc<dyn SessionRefresher>,
    registry: ChannelRegistry,
    config: HealthConfig,
    checking: AtomicBool,
    backgrounded_at: Mutex<Option<Instant>>,
}

/// Clears the in-progress flag however the check ends, including when the
/// check future is dropped by a timeout.
struct CheckGuard<'a>(&'a AtomicBool);

impl Drop for CheckGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl HealthMonitor {
    pub fn new(
        store: Arc<dyn BackingStore>,
        session: Arc<dyn SessionRefresher>,
        registry: ChannelRegistry,
        config: HealthConfig,
    ) -> Self {
        Self {
            store,
            session,
            registry,
            config,
            checking: AtomicBool::new(false),
            backgrounded_at: Mutex::new(None),
        }
    }

    pub fn is_checking(&self) -> bool {
        self.checking.load(Ordering::Acquire)
    }

    /// One lightweight read against the store. The read races a timer; a late
    /// response is simply ignored.
    pub async fn probe(&self) -> Result<Duration, StoreError> {
        let started = Instant::now();
        match tokio::time::timeout(self.config.probe_timeout, self.store.ping()).await {
            Err(_) => Err(StoreError::Timeout(self.config.probe_timeout)),
            Ok(Err(e)) => Err(e),
            Ok(Ok(())) => {
                let elapsed = started.elapsed();
                if elapsed > self.config.slow_threshold {
                    Err(StoreError::Timeout(elapsed))
                } else {
                    Ok(elapsed)
                }
            }
        }
    }

    /// Probe, and on failure refresh the session and probe again. If the
    /// connection is still broken, every registered channel is recreated.
    pub async fn check(&self) -> HealthOutcome {
        if self.checking.swap(true, Ordering::AcqRel) {
            debug!("health check already in progress, skipping");
            return HealthOutcome::Skipped;
        }
        let _guard = CheckGuard(&self.checking);

        let failure = match self.probe().await {
            Ok(elapsed) => {
                debug!("health probe ok in {:?}", elapsed);
                return HealthOutcome::Healthy;
            }
            Err(e) => e,
        };
        warn!("health probe failed: {}", failure);

        let recovered = match tokio::time::timeout(self.config.recovery_timeout, self.recover(&failure)).await {
            Ok(recovered) => recovered,
            Err(_) => {
                warn!("connection recovery hung for {:?}, abandoning it", self.config.recovery_timeout);
                false
            }
        };

        if recovered {
            info!("connection recovered without reconnecting channels");
            return HealthOutcome::Recovered;
        }

        let channels = self.registry.request_reconnect_all();
        warn!("connection still failing, reconnecting {} channels", channels);
        HealthOutcome::Reconnected { channels }
    }

    async fn recover(&self, failure: &StoreError) -> bool {
        // A stale session only reproduces the same error on retry.
        if failure.is_auth() {
            info!("refreshing session after auth failure");
            if let Err(e) = self.session.refresh().await {
                warn!("session refresh failed: {}", e);
                return false;
            }
        }
        match self.probe().await {
            Ok(_) => true,
            Err(e) => {
                warn!("health re-probe failed: {}", e);
                false
            }
        }
    }

    /// Feed a process lifecycle transition. Returns the check outcome when
    /// the transition triggered one.
    pub async fn on_lifecycle(&self, event: AppLifecycle) -> Option<HealthOutcome> {
        match event {
            AppLifecycle::Background => {
                *self.backgrounded_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
                None
            }
            AppLifecycle::Foreground => {
                let since = self
                    .backgrounded_at
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                let away = since?.elapsed();
                if away <= self.config.background_threshold {
                    return None;
                }
                info!("back in foreground after {:?}, checking connection", away);
                Some(self.check().await)
            }
        }
    }

    fn in_background(&self) -> bool {
        self.backgrounded_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Run periodic probes while in the foreground and react to lifecycle
    /// transitions until `cancel` fires.
    pub fn spawn(
        self: Arc<Self>,
        mut lifecycle: mpsc::Receiver<AppLifecycle>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if !self.in_background() {
                            self.check().await;
                        }
                    }
                    Some(event) = lifecycle.recv() => {
                        self.on_lifecycle(event).await;
                    }
                }
            }
            debug!("health monitor stopped");
        })
    }
}
