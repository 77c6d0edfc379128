//! "Who is acting" broadcasts between peers in one campaign.
//!
//! These messages are never stored. The acting client announces a start
//! before its write lands and a completion after, in both the success and
//! the failure path. Peers show the in-progress action and drop it on
//! completion, or after a timeout if the completion never arrives, in which
//! case they re-fetch history because the outcome is unknown.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use saga_types::events::TurnEvent;
use saga_types::subscription::SubscriptionDescriptor;

use crate::registry::SubscriptionCache;
use crate::supervisor::{ChannelHandle, ConnectionSupervisor, Inbound, InboundHandler};
use crate::teardown::Teardown;

pub const DEFAULT_TURN_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub timeout: Duration,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TURN_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActingPlayer {
    pub player_name: String,
    pub action: String,
}

/// Called with the campaign id when a peer's action timed out.
pub type ReconcileFn = Arc<dyn Fn(Uuid) + Send + Sync>;

pub fn channel_name(campaign_id: Uuid) -> String {
    format!("campaign-turns:{campaign_id}")
}

/// Joined turn channels, one per campaign.
#[derive(Clone)]
pub struct TurnCoordinator {
    supervisor: ConnectionSupervisor,
    config: TurnConfig,
    open: Arc<SubscriptionCache<Uuid, TurnChannel>>,
}

impl TurnCoordinator {
    pub fn new(supervisor: ConnectionSupervisor, config: TurnConfig) -> Self {
        Self {
            supervisor,
            config,
            open: Arc::new(SubscriptionCache::new()),
        }
    }

    /// Join the campaign's turn channel as `local_player_id`.
    ///
    /// A campaign that is already joined hands back the live channel, and
    /// the first joiner's reconcile callback stays in charge.
    pub fn join(&self, campaign_id: Uuid, local_player_id: Uuid, on_timeout: ReconcileFn) -> TurnChannel {
        let acquired = self
            .open
            .acquire(campaign_id, || self.subscribe(campaign_id, local_player_id, on_timeout));
        if acquired.reused {
            debug!("reusing turn channel for campaign {}", campaign_id);
            if acquired.value.state.local_player_id != local_player_id {
                warn!(
                    "campaign {} turn channel already joined as {}, not {}",
                    campaign_id, acquired.value.state.local_player_id, local_player_id
                );
            }
        }
        acquired.value
    }

    pub fn get(&self, campaign_id: Uuid) -> Option<TurnChannel> {
        self.open.get(&campaign_id)
    }

    /// Leave one campaign's turn channel. False if it was not joined.
    pub fn leave(&self, campaign_id: Uuid) -> bool {
        self.open.release(&campaign_id)
    }

    pub fn leave_all(&self) {
        self.open.release_all();
    }

    fn subscribe(&self, campaign_id: Uuid, local_player_id: Uuid, on_timeout: ReconcileFn) -> (TurnChannel, Teardown) {
        let (view, _) = watch::channel(HashMap::new());
        let state = Arc::new(TurnState {
            campaign_id,
            local_player_id,
            timeout: self.config.timeout,
            on_timeout,
            pending: Mutex::new(HashMap::new()),
            view,
            seq: AtomicU64::new(0),
        });

        let handler: InboundHandler = {
            let state = Arc::downgrade(&state);
            Arc::new(move |inbound: Inbound| {
                let Inbound::Broadcast { event, payload } = inbound else {
                    return;
                };
                let Some(state) = state.upgrade() else {
                    return;
                };
                match TurnEvent::from_broadcast(&event, &payload) {
                    Some(turn) => state.receive(turn),
                    None => debug!("ignoring {} broadcast on turn channel", event),
                }
            })
        };

        let channel = self.supervisor.supervise(
            channel_name(campaign_id),
            SubscriptionDescriptor::broadcast_only(),
            handler,
        );

        let teardown = {
            let state = state.clone();
            channel.teardown().then(move || state.clear())
        };
        let turn = TurnChannel {
            channel,
            state,
            open: Arc::downgrade(&self.open),
        };
        (turn, teardown)
    }
}

struct Pending {
    acting: ActingPlayer,
    seq: u64,
    timer: AbortHandle,
}

struct TurnState {
    campaign_id: Uuid,
    local_player_id: Uuid,
    timeout: Duration,
    on_timeout: ReconcileFn,
    pending: Mutex<HashMap<Uuid, Pending>>,
    view: watch::Sender<HashMap<Uuid, ActingPlayer>>,
    seq: AtomicU64,
}

impl TurnState {
    fn receive(self: &Arc<Self>, event: TurnEvent) {
        match event {
            TurnEvent::ActionStarted {
                player_id,
                player_name,
                action,
            } => {
                if player_id == self.local_player_id {
                    return;
                }
                self.started(player_id, ActingPlayer { player_name, action });
            }
            TurnEvent::ActionCompleted { player_id, success } => {
                let removed = self
                    .pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&player_id);
                if let Some(pending) = removed {
                    pending.timer.abort();
                    debug!("{} finished acting (success: {})", pending.acting.player_name, success);
                    self.publish();
                }
            }
        }
    }

    fn started(self: &Arc<Self>, player_id: Uuid, acting: ActingPlayer) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let timer = {
            let state: Weak<Self> = Arc::downgrade(self);
            let timeout = self.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(state) = state.upgrade() {
                    state.expire(player_id, seq);
                }
            })
            .abort_handle()
        };

        info!("{} is acting: {}", acting.player_name, acting.action);
        let replaced = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(player_id, Pending { acting, seq, timer });
        if let Some(previous) = replaced {
            previous.timer.abort();
        }
        self.publish();
    }

    fn expire(&self, player_id: Uuid, seq: u64) {
        let expired = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            // A newer start from the same player owns the entry now.
            let current = pending.get(&player_id).is_some_and(|entry| entry.seq == seq);
            if current { pending.remove(&player_id) } else { None }
        };
        let Some(expired) = expired else {
            return;
        };
        warn!(
            "{} never reported completing \"{}\" in campaign {}, reconciling",
            expired.acting.player_name, expired.acting.action, self.campaign_id
        );
        self.publish();
        (self.on_timeout)(self.campaign_id);
    }

    fn publish(&self) {
        let view = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(&id, pending)| (id, pending.acting.clone()))
            .collect();
        self.view.send_replace(view);
    }

    fn clear(&self) {
        let drained: Vec<Pending> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, pending)| pending)
            .collect();
        for pending in drained {
            pending.timer.abort();
        }
        self.publish();
    }
}

/// One client's membership in a campaign's turn channel.
#[derive(Clone)]
pub struct TurnChannel {
    channel: ChannelHandle,
    state: Arc<TurnState>,
    open: Weak<SubscriptionCache<Uuid, TurnChannel>>,
}

impl TurnChannel {
    pub fn campaign_id(&self) -> Uuid {
        self.state.campaign_id
    }

    pub fn channel(&self) -> &ChannelHandle {
        &self.channel
    }

    /// Peers currently acting, never including the local player.
    pub fn acting(&self) -> watch::Receiver<HashMap<Uuid, ActingPlayer>> {
        self.state.view.subscribe()
    }

    pub fn announce_started(&self, player_id: Uuid, player_name: &str, action: &str) {
        self.announce(TurnEvent::ActionStarted {
            player_id,
            player_name: player_name.to_string(),
            action: action.to_string(),
        });
    }

    pub fn announce_completed(&self, player_id: Uuid, success: bool) {
        self.announce(TurnEvent::ActionCompleted { player_id, success });
    }

    fn announce(&self, event: TurnEvent) {
        let (name, payload) = event.into_broadcast();
        self.channel.broadcast(name, payload);
    }

    /// Run one action submission for the local player, bracketed by a
    /// started and a completed announcement. The completion goes out on
    /// success, on error, and if the submission future is dropped early.
    pub async fn perform<T, E, F>(&self, player_name: &str, action: &str, submission: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let player_id = self.state.local_player_id;
        self.announce_started(player_id, player_name, action);
        let mut completion = Completion {
            turn: self,
            player_id,
            success: false,
        };
        let result = submission.await;
        completion.success = result.is_ok();
        result
    }

    /// Leave the channel and forget every peer's in-progress action.
    pub fn leave(&self) {
        let campaign_id = self.state.campaign_id;
        if let Some(open) = self.open.upgrade() {
            let current = open
                .get(&campaign_id)
                .is_some_and(|live| Arc::ptr_eq(&live.state, &self.state));
            if current && open.release(&campaign_id) {
                return;
            }
        }
        self.state.clear();
        self.channel.close();
    }
}

struct Completion<'a> {
    turn: &'a TurnChannel,
    player_id: Uuid,
    success: bool,
}

impl Drop for Completion<'_> {
    fn drop(&mut self) {
        self.turn.announce_completed(self.player_id, self.success);
    }
}
