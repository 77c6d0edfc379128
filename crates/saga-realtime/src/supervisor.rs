//! Ownership of one named channel, from open to teardown.
//!
//! ```text
//! connecting -> subscribed
//! connecting -> reconnecting -> connecting   (bounded by max_attempts)
//! reconnecting -> failed                     (attempts exhausted, waits for retry)
//! any -> closed                              (teardown, terminal)
//! ```
//!
//! The channel name stays registered for the whole life of the supervisor,
//! across every recreate-on-error cycle, and is released exactly once by the
//! teardown.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Notify, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use saga_types::events::ChangeEvent;
use saga_types::subscription::SubscriptionDescriptor;

use crate::error::RealtimeError;
use crate::registry::ChannelRegistry;
use crate::teardown::Teardown;
use crate::transport::{ChannelStatus, Transport, TransportEvent, TransportHandle};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Exponential backoff bookkeeping for one channel.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: SupervisorConfig,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config, attempts: 0 }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// `min(base * 2^attempt, max)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.config.base_delay.saturating_mul(factor).min(self.config.max_delay)
    }

    /// Delay before the next reconnect, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.config.max_attempts {
            return None;
        }
        let delay = self.delay_for(self.attempts);
        self.attempts += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Subscribed,
    Reconnecting { attempt: u32, delay: Duration },
    /// Attempts exhausted. Stays here until `retry`, `reconnect` or teardown.
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub state: ChannelState,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
}

impl ChannelSnapshot {
    fn new(state: ChannelState) -> Self {
        Self {
            state,
            reconnect_attempts: 0,
            last_error: None,
        }
    }
}

/// Payload-carrying events handed to the channel's owner.
#[derive(Debug, Clone)]
pub enum Inbound {
    Change(ChangeEvent),
    Broadcast { event: String, payload: Value },
}

pub type InboundHandler = Arc<dyn Fn(Inbound) + Send + Sync>;

#[derive(Debug)]
enum Control {
    Retry,
    Reconnect,
}

type LiveSlot = Arc<Mutex<Option<Box<dyn TransportHandle>>>>;

/// Opens supervised channels. Cheap to clone; every clone shares the
/// transport and the registry.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    transport: Arc<dyn Transport>,
    registry: ChannelRegistry,
    config: SupervisorConfig,
}

impl ConnectionSupervisor {
    pub fn new(transport: Arc<dyn Transport>, registry: ChannelRegistry, config: SupervisorConfig) -> Self {
        Self {
            transport,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Start supervising `name`. Must be called inside a Tokio runtime.
    ///
    /// If `name` is already registered the returned handle is inert: its
    /// teardown is a no-op and no transport subscription is opened.
    pub fn supervise(
        &self,
        name: impl Into<String>,
        descriptor: SubscriptionDescriptor,
        handler: InboundHandler,
    ) -> ChannelHandle {
        let name: Arc<str> = Arc::from(name.into());

        let Some(reconnect_signal) = self.registry.acquire(&name) else {
            warn!("channel {} is already live, returning no-op handle", name);
            return ChannelHandle::duplicate(name);
        };

        let (status_tx, status_rx) = watch::channel(ChannelSnapshot::new(ChannelState::Connecting));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let live: LiveSlot = Arc::new(Mutex::new(None));

        let teardown = {
            let cancel = cancel.clone();
            let live = live.clone();
            let registry = self.registry.clone();
            let name = name.clone();
            Teardown::new(move || {
                cancel.cancel();
                let handle = live.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(handle) = handle {
                    handle.unsubscribe();
                }
                registry.unregister(&name);
                info!("channel {} torn down", name);
            })
        };

        let task = ChannelTask {
            name: name.clone(),
            descriptor,
            transport: self.transport.clone(),
            handler,
            live: live.clone(),
            cancel,
            status: status_tx,
            control: control_rx,
            reconnect_signal,
            policy: ReconnectPolicy::new(self.config.clone()),
            last_error: None,
        };
        tokio::spawn(task.run());

        ChannelHandle {
            name,
            teardown,
            status: status_rx,
            control: Some(control_tx),
            live,
        }
    }
}

/// Caller-side view of a supervised channel.
#[derive(Clone)]
pub struct ChannelHandle {
    name: Arc<str>,
    teardown: Teardown,
    status: watch::Receiver<ChannelSnapshot>,
    control: Option<mpsc::UnboundedSender<Control>>,
    live: LiveSlot,
}

impl ChannelHandle {
    fn duplicate(name: Arc<str>) -> Self {
        let (_, status) = watch::channel(ChannelSnapshot::new(ChannelState::Closed));
        Self {
            name,
            teardown: Teardown::noop(),
            status,
            control: None,
            live: Arc::new(Mutex::new(None)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when this handle lost a registration race and owns nothing.
    pub fn is_duplicate(&self) -> bool {
        self.teardown.is_noop()
    }

    pub fn teardown(&self) -> Teardown {
        self.teardown.clone()
    }

    pub fn close(&self) {
        self.teardown.run();
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        self.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ChannelSnapshot> {
        self.status.clone()
    }

    /// Fire-and-forget. Dropped with a debug log while not connected.
    pub fn broadcast(&self, event: &str, payload: Value) {
        let live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        match live.as_ref() {
            Some(handle) => handle.broadcast(event, payload),
            None => debug!("dropping {} broadcast on {}: not connected", event, self.name),
        }
    }

    /// Reset the attempt counter and reconnect a channel that gave up.
    pub fn retry(&self) {
        self.send(Control::Retry);
    }

    /// Recreate the subscription now, whatever its state.
    pub fn reconnect(&self) {
        self.send(Control::Reconnect);
    }

    fn send(&self, control: Control) {
        if let Some(tx) = &self.control {
            let _ = tx.send(control);
        }
    }

    /// Resolves once subscribed. Fails once the channel has given up or closed.
    pub async fn wait_subscribed(&self) -> Result<(), RealtimeError> {
        let mut status = self.status.clone();
        let settled = status
            .wait_for(|s| matches!(s.state, ChannelState::Subscribed | ChannelState::Failed | ChannelState::Closed))
            .await
            .map(|s| s.clone());
        match settled {
            Ok(ChannelSnapshot {
                state: ChannelState::Subscribed,
                ..
            }) => Ok(()),
            Ok(ChannelSnapshot {
                state: ChannelState::Failed,
                reconnect_attempts,
                ..
            }) => Err(RealtimeError::RetriesExhausted {
                channel: self.name.to_string(),
                attempts: reconnect_attempts,
            }),
            _ => Err(RealtimeError::Closed(self.name.to_string())),
        }
    }
}

/// Why one connected session of the channel ended.
enum SessionEnd {
    Failed(String),
    Restart,
    Cancelled,
}

struct ChannelTask {
    name: Arc<str>,
    descriptor: SubscriptionDescriptor,
    transport: Arc<dyn Transport>,
    handler: InboundHandler,
    live: LiveSlot,
    cancel: CancellationToken,
    status: watch::Sender<ChannelSnapshot>,
    control: mpsc::UnboundedReceiver<Control>,
    reconnect_signal: Arc<Notify>,
    policy: ReconnectPolicy,
    last_error: Option<String>,
}

impl ChannelTask {
    async fn run(mut self) {
        loop {
            self.publish(ChannelState::Connecting);

            let reason = match self.transport.open(&self.name, &self.descriptor) {
                Ok(channel) => {
                    if !self.install(channel.handle) {
                        break;
                    }
                    match self.pump(channel.events).await {
                        SessionEnd::Failed(reason) => reason,
                        SessionEnd::Restart => {
                            self.drop_live();
                            continue;
                        }
                        SessionEnd::Cancelled => break,
                    }
                }
                Err(e) => e.to_string(),
            };

            // Stale subscription goes first so its late errors cannot
            // schedule a second, overlapping attempt.
            self.drop_live();
            self.last_error = Some(reason);

            let resumed = match self.policy.next_delay() {
                Some(delay) => {
                    warn!(
                        "channel {} failed ({}), reconnect {} of {} in {:?}",
                        self.name,
                        self.last_error.as_deref().unwrap_or_default(),
                        self.policy.attempts(),
                        self.policy.config.max_attempts,
                        delay
                    );
                    self.publish(ChannelState::Reconnecting {
                        attempt: self.policy.attempts(),
                        delay,
                    });
                    self.backoff(delay).await
                }
                None => {
                    error!(
                        "channel {} giving up after {} reconnect attempts: {}",
                        self.name,
                        self.policy.attempts(),
                        self.last_error.as_deref().unwrap_or_default()
                    );
                    self.publish(ChannelState::Failed);
                    self.park().await
                }
            };
            if !resumed {
                break;
            }
        }

        self.drop_live();
        self.publish(ChannelState::Closed);
        debug!("supervisor for {} stopped", self.name);
    }

    /// Stores the new transport handle unless teardown already ran, in
    /// which case the handle is released here instead of leaking.
    fn install(&self, handle: Box<dyn TransportHandle>) -> bool {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if self.cancel.is_cancelled() {
            handle.unsubscribe();
            return false;
        }
        *live = Some(handle);
        true
    }

    fn drop_live(&self) {
        let handle = self.live.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            handle.unsubscribe();
        }
    }

    async fn pump(&mut self, mut events: mpsc::UnboundedReceiver<TransportEvent>) -> SessionEnd {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
                Some(control) = self.control.recv() => {
                    if let Control::Reconnect = control {
                        info!("channel {} reconnect requested", self.name);
                        self.policy.reset();
                        return SessionEnd::Restart;
                    }
                }
                _ = self.reconnect_signal.notified() => {
                    info!("channel {} recreating after health check", self.name);
                    self.policy.reset();
                    return SessionEnd::Restart;
                }
                event = events.recv() => match event {
                    Some(TransportEvent::Status(ChannelStatus::Subscribed)) => {
                        self.policy.reset();
                        self.last_error = None;
                        self.publish(ChannelState::Subscribed);
                        info!("channel {} subscribed", self.name);
                    }
                    Some(TransportEvent::Status(ChannelStatus::ChannelError(reason))) => {
                        return SessionEnd::Failed(reason);
                    }
                    Some(TransportEvent::Status(ChannelStatus::TimedOut)) => {
                        return SessionEnd::Failed("timed out".into());
                    }
                    Some(TransportEvent::Status(ChannelStatus::Closed)) => {
                        return SessionEnd::Failed("closed by transport".into());
                    }
                    Some(TransportEvent::Change(change)) => (self.handler)(Inbound::Change(change)),
                    Some(TransportEvent::Broadcast { event, payload }) => {
                        (self.handler)(Inbound::Broadcast { event, payload })
                    }
                    None => return SessionEnd::Failed("event stream ended".into()),
                },
            }
        }
    }

    /// Waits out one backoff delay. Returns false if torn down meanwhile.
    async fn backoff(&mut self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
            Some(_) = self.control.recv() => {
                self.policy.reset();
                true
            }
            _ = self.reconnect_signal.notified() => {
                self.policy.reset();
                true
            }
        }
    }

    /// Terminal error: nothing happens until a retry, a reconnect or teardown.
    async fn park(&mut self) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            control = self.control.recv() => {
                if control.is_none() {
                    // Every handle is gone; only teardown can end this now.
                    self.cancel.cancelled().await;
                    return false;
                }
                info!("channel {} retrying after giving up", self.name);
                self.policy.reset();
                true
            }
            _ = self.reconnect_signal.notified() => {
                self.policy.reset();
                true
            }
        }
    }

    fn publish(&self, state: ChannelState) {
        self.status.send_replace(ChannelSnapshot {
            state,
            reconnect_attempts: self.policy.attempts(),
            last_error: self.last_error.clone(),
        });
    }
}
