//! Suggested player actions for one (campaign, character, game mode).
//!
//! Actions expire on their own. Expired rows are hidden from every read as
//! soon as their deadline passes and are dropped from the mirror by a sweep
//! that runs for as long as the scope is open.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use saga_realtime::supervisor::{Inbound, InboundHandler};
use saga_realtime::{ChannelHandle, ConnectionSupervisor, SubscriptionCache, Teardown};
use saga_types::events::{ChangeEvent, Table};
use saga_types::models::{ActionScope, PlayerAction};
use saga_types::store::{BackingStore, StoreError};
use saga_types::subscription::{Interest, RowFilter, SubscriptionDescriptor};

use crate::error::SyncError;
use crate::feed::Feed;
use crate::mirror::Mirror;

#[derive(Debug, Clone)]
pub struct ActionsConfig {
    pub sweep_interval: Duration,
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
        }
    }
}

pub fn channel_name(scope: &ActionScope) -> String {
    format!(
        "player-actions:{}:{}:{}",
        scope.campaign_id, scope.character_id, scope.game_mode
    )
}

/// Filtered on the character; campaign and game mode are checked on arrival.
pub fn descriptor(scope: &ActionScope) -> SubscriptionDescriptor {
    SubscriptionDescriptor::default()
        .with(Interest::all(Table::PlayerActions).filtered(RowFilter::eq("character_id", scope.character_id)))
}

fn in_scope(event: &ChangeEvent, scope: &ActionScope) -> bool {
    event.uuid("campaign_id") == Some(scope.campaign_id)
        && event.column("game_mode").and_then(|mode| mode.as_str()) == Some(scope.game_mode.as_str())
}

fn live(action: &PlayerAction) -> bool {
    !action.is_expired(Utc::now())
}

#[derive(Clone)]
pub struct ActionsSync {
    store: Arc<dyn BackingStore>,
    supervisor: ConnectionSupervisor,
    config: ActionsConfig,
    open: Arc<SubscriptionCache<ActionScope, ActionFeed>>,
}

impl ActionsSync {
    pub fn new(store: Arc<dyn BackingStore>, supervisor: ConnectionSupervisor, config: ActionsConfig) -> Self {
        Self {
            store,
            supervisor,
            config,
            open: Arc::new(SubscriptionCache::new()),
        }
    }

    pub async fn open(&self, scope: ActionScope) -> Result<ActionFeed, SyncError> {
        let acquired = self.open.acquire(scope.clone(), || self.subscribe(scope.clone()));
        let actions = acquired.value;
        if acquired.reused {
            return Ok(actions);
        }

        if let Err(e) = actions.feed.reload().await {
            warn!("initial action fetch for {} failed: {}", channel_name(&scope), e);
            self.open.release(&scope);
            return Err(e.into());
        }
        info!("opened {} ({} actions)", channel_name(&scope), actions.feed.len());
        Ok(actions)
    }

    pub fn get(&self, scope: &ActionScope) -> Option<ActionFeed> {
        self.open.get(scope)
    }

    pub fn close(&self, scope: &ActionScope) -> bool {
        self.open.release(scope)
    }

    pub fn close_all(&self) {
        self.open.release_all();
    }

    fn subscribe(&self, scope: ActionScope) -> (ActionFeed, Teardown) {
        let loader = {
            let store = self.store.clone();
            let scope = scope.clone();
            Box::new(move || {
                let store = store.clone();
                let scope = scope.clone();
                async move { store.fetch_actions(scope).await }.boxed()
            })
        };
        let feed = Arc::new(Feed::new(channel_name(&scope), Mirror::new(), loader).filtered(live));

        let handler: InboundHandler = {
            let feed = feed.clone();
            let scope = scope.clone();
            Arc::new(move |inbound: Inbound| {
                let Inbound::Change(event) = inbound else {
                    return;
                };
                if in_scope(&event, &scope) {
                    feed.ingest(&event);
                }
            })
        };
        let channel = self.supervisor.supervise(channel_name(&scope), descriptor(&scope), handler);

        let stop = CancellationToken::new();
        spawn_sweeper(feed.clone(), self.config.sweep_interval, stop.clone());
        let teardown = channel.teardown().then(move || stop.cancel());

        let actions = ActionFeed {
            scope,
            feed,
            channel,
            store: self.store.clone(),
        };
        (actions, teardown)
    }
}

fn spawn_sweeper(feed: Arc<Feed<PlayerAction>>, every: Duration, stop: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    sweep(&feed);
                }
            }
        }
        debug!("{}: expiry sweep stopped", feed.label());
    });
}

fn sweep(feed: &Feed<PlayerAction>) -> usize {
    let now = Utc::now();
    let dropped = feed.retain(|action| !action.is_expired(now));
    if dropped > 0 {
        debug!("{}: swept {} expired actions", feed.label(), dropped);
    }
    dropped
}

/// Live actions of one scope, highest priority first.
#[derive(Clone)]
pub struct ActionFeed {
    scope: ActionScope,
    feed: Arc<Feed<PlayerAction>>,
    channel: ChannelHandle,
    store: Arc<dyn BackingStore>,
}

impl ActionFeed {
    pub fn scope(&self) -> &ActionScope {
        &self.scope
    }

    pub fn actions(&self) -> Vec<PlayerAction> {
        self.feed.rows()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<PlayerAction>> {
        self.feed.subscribe()
    }

    pub fn channel(&self) -> &ChannelHandle {
        &self.channel
    }

    /// Rows held locally, expired ones included until the next sweep.
    pub fn stored(&self) -> usize {
        self.feed.stored()
    }

    /// Drop expired actions now instead of waiting for the next sweep.
    pub fn sweep(&self) -> usize {
        sweep(&self.feed)
    }

    pub async fn refetch(&self) -> Result<usize, SyncError> {
        Ok(self.feed.reload().await?)
    }

    /// Use up an action. An action another device consumed first counts as
    /// consumed here too.
    pub async fn consume(&self, action_id: Uuid) -> Result<(), SyncError> {
        match self.store.delete_action(action_id).await {
            Ok(()) => {}
            Err(StoreError::NotFound) => debug!("action {} was already consumed", action_id),
            Err(e) => return Err(e.into()),
        }
        self.feed.remove(&action_id);
        Ok(())
    }
}
