//! Composition root: one registry, one router and one health monitor per
//! client, with the feature synchronizers mounted on top.

pub mod config;
pub mod session;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use saga_realtime::health::{AppLifecycle, HealthMonitor, SessionRefresher};
use saga_realtime::router::{TableHandler, TableRouter};
use saga_realtime::turn::{TurnChannel, TurnCoordinator};
use saga_realtime::{ChannelRegistry, ConnectionSupervisor, Transport};
use saga_sync::{
    ActionFeed, ActionsSync, CampaignHistory, HistorySync, LevelSync, ReadStatusSync, SummarySync, SyncError,
};
use saga_types::events::{ChangeEvent, Table};
use saga_types::models::{ActionScope, CampaignMessage, MessageKind, NewMessage};
use saga_types::store::BackingStore;

pub use config::ClientConfig;
pub use session::HttpSession;

/// Initialise the global tracing subscriber. `RUST_LOG` wins over the
/// `saga=debug` default.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "saga=debug".into()),
        )
        .init();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Player {
    pub id: Uuid,
    pub name: String,
}

/// Per-user synchronizers, mounted on sign-in.
#[derive(Clone)]
pub struct UserSession {
    pub user_id: Uuid,
    pub read_status: ReadStatusSync,
    pub levels: LevelSync,
    pub summaries: SummarySync,
}

pub struct SagaClient {
    store: Arc<dyn BackingStore>,
    registry: ChannelRegistry,
    supervisor: ConnectionSupervisor,
    router: TableRouter,
    health: Arc<HealthMonitor>,
    history: HistorySync,
    actions: ActionsSync,
    turns: TurnCoordinator,
    mounts: Mounts,
    user: Mutex<Option<UserSession>>,
}

impl SagaClient {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn BackingStore>,
        session: Arc<dyn SessionRefresher>,
    ) -> Self {
        let registry = ChannelRegistry::new();
        let supervisor = ConnectionSupervisor::new(transport, registry.clone(), config.supervisor());
        let health = Arc::new(HealthMonitor::new(
            store.clone(),
            session,
            registry.clone(),
            config.health(),
        ));

        Self {
            router: TableRouter::new(supervisor.clone()),
            history: HistorySync::new(store.clone(), supervisor.clone(), config.history()),
            actions: ActionsSync::new(store.clone(), supervisor.clone(), config.actions()),
            turns: TurnCoordinator::new(supervisor.clone(), config.turn()),
            store,
            registry,
            supervisor,
            health,
            mounts: Mounts::default(),
            user: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    pub fn router(&self) -> &TableRouter {
        &self.router
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    /// Start periodic health probing, fed by app lifecycle transitions.
    pub fn spawn_health(&self, lifecycle: mpsc::Receiver<AppLifecycle>, cancel: CancellationToken) -> JoinHandle<()> {
        self.health.clone().spawn(lifecycle, cancel)
    }

    pub fn current_user(&self) -> Option<UserSession> {
        self.user.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Connect the user's multiplexed channel and load their per-user state.
    ///
    /// Signing in as someone else first drops everything mounted for the
    /// previous user. Signing in again as the same user is a no-op.
    pub async fn sign_in(&self, user_id: Uuid) -> Result<UserSession, SyncError> {
        if let Some(current) = self.current_user() {
            if current.user_id == user_id {
                return Ok(current);
            }
            info!("switching user {} -> {}", current.user_id, user_id);
            self.sign_out();
        }

        let session = UserSession {
            user_id,
            read_status: ReadStatusSync::new(self.store.clone(), user_id),
            levels: LevelSync::new(self.store.clone(), user_id),
            summaries: SummarySync::new(self.store.clone(), user_id),
        };
        let channel = self.router.connect(user_id, self.handlers(&session));
        if let Err(e) = channel.wait_subscribed().await {
            warn!("user channel for {} never came up: {}", user_id, e);
            self.router.disconnect();
            return Err(e.into());
        }

        if let Err(e) = load(&session).await {
            warn!("initial load for {} failed: {}", user_id, e);
            self.router.disconnect();
            return Err(e);
        }

        *self.user.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        info!("signed in as {}", user_id);
        Ok(session)
    }

    fn handlers(&self, session: &UserSession) -> HashMap<Table, TableHandler> {
        let history = self.history.clone();
        let summaries = session.summaries.clone();
        HashMap::from([
            (Table::ReadStatus, session.read_status.handler()),
            (Table::Characters, session.levels.handler()),
            (Table::CampaignSummaries, session.summaries.handler()),
            (
                Table::CampaignHistory,
                Arc::new(move |event: &ChangeEvent| history.route(event)) as TableHandler,
            ),
            // Membership changes can add or drop whole campaigns.
            (
                Table::Campaigns,
                Arc::new(move |_: &ChangeEvent| {
                    summaries.refresh();
                }) as TableHandler,
            ),
        ])
    }

    pub fn sign_out(&self) {
        let previous = self.user.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.router.disconnect();
        self.mounts.clear();
        self.turns.leave_all();
        self.history.close_all();
        self.actions.close_all();
        if let Some(previous) = previous {
            info!("signed out {}", previous.user_id);
        }
    }

    /// Mount a campaign: its history and its turn-coordination channel. A
    /// peer action that never completes triggers a history re-fetch.
    ///
    /// Resolves once both channels are subscribed. Mounting a campaign that
    /// is already open shares its subscriptions, which stay up until the
    /// last [`CampaignSession`] for it is closed.
    pub async fn open_campaign(&self, campaign_id: Uuid, player: Player) -> Result<CampaignSession, SyncError> {
        let mount = self.mounts.mount(campaign_id, &self.history, &self.turns);
        let history = self.history.open(campaign_id).await?;
        let on_timeout = {
            let sync = self.history.clone();
            Arc::new(move |campaign_id: Uuid| {
                sync.reconcile(campaign_id);
            })
        };
        let turn = self.turns.join(campaign_id, player.id, on_timeout);
        let session = CampaignSession {
            player,
            history,
            turn,
            _mount: mount,
        };

        session.history.channel().wait_subscribed().await?;
        session.turn.channel().wait_subscribed().await?;
        info!("{} joined campaign {}", session.player.name, campaign_id);
        Ok(session)
    }

    /// Number of open [`CampaignSession`]s for the campaign.
    pub fn mounted(&self, campaign_id: Uuid) -> usize {
        self.mounts.count(campaign_id)
    }

    pub async fn open_actions(&self, scope: ActionScope) -> Result<ActionFeed, SyncError> {
        self.actions.open(scope).await
    }

    pub fn close_actions(&self, scope: &ActionScope) -> bool {
        self.actions.close(scope)
    }
}

async fn load(session: &UserSession) -> Result<(), SyncError> {
    session.read_status.load().await?;
    session.levels.load().await?;
    session.summaries.load().await?;
    Ok(())
}

impl Drop for SagaClient {
    fn drop(&mut self) {
        self.sign_out();
    }
}

/// Open campaign sessions, keyed by campaign.
#[derive(Clone, Default)]
struct Mounts {
    next: Arc<AtomicU64>,
    open: Arc<Mutex<HashMap<Uuid, HashSet<u64>>>>,
}

impl Mounts {
    fn mount(&self, campaign_id: Uuid, history: &HistorySync, turns: &TurnCoordinator) -> Mount {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(campaign_id)
            .or_default()
            .insert(id);
        Mount {
            campaign_id,
            id,
            mounts: self.clone(),
            history: history.clone(),
            turns: turns.clone(),
        }
    }

    fn count(&self, campaign_id: Uuid) -> usize {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&campaign_id)
            .map_or(0, HashSet::len)
    }

    /// Forget every mount. Sessions opened before this no longer own anything.
    fn clear(&self) {
        self.open.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// One session's claim on a campaign's shared subscriptions.
struct Mount {
    campaign_id: Uuid,
    id: u64,
    mounts: Mounts,
    history: HistorySync,
    turns: TurnCoordinator,
}

impl Drop for Mount {
    fn drop(&mut self) {
        let mut open = self.mounts.open.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(ids) = open.get_mut(&self.campaign_id) else {
            return;
        };
        if !ids.remove(&self.id) || !ids.is_empty() {
            return;
        }
        open.remove(&self.campaign_id);
        // Still holding the lock, so no new mount can race the release.
        self.turns.leave(self.campaign_id);
        self.history.close(self.campaign_id);
        debug!("last session for campaign {} closed", self.campaign_id);
    }
}

/// One player's view of an open campaign.
///
/// Dropping it has the same effect as [`CampaignSession::close`].
pub struct CampaignSession {
    player: Player,
    history: CampaignHistory,
    turn: TurnChannel,
    _mount: Mount,
}

impl CampaignSession {
    pub fn campaign_id(&self) -> Uuid {
        self.history.campaign_id()
    }

    pub fn player(&self) -> &Player {
        &self.player
    }

    pub fn history(&self) -> &CampaignHistory {
        &self.history
    }

    pub fn turn(&self) -> &TurnChannel {
        &self.turn
    }

    /// Submit the player's move. Peers see the player acting until the
    /// write settles, whichever way it goes.
    pub async fn take_turn(&self, content: &str) -> Result<CampaignMessage, SyncError> {
        let message = NewMessage {
            campaign_id: self.campaign_id(),
            author_id: Some(self.player.id),
            author_name: self.player.name.clone(),
            kind: MessageKind::Player,
            content: content.to_string(),
            character_id: None,
        };
        self.turn
            .perform(&self.player.name, content, self.history.send_message(message))
            .await
    }

    /// Give up this session. The campaign's turn channel and history
    /// subscription are released when no other session for it is open.
    pub fn close(self) {
        drop(self);
    }
}
