//! Campaign message history, one dedicated channel per open campaign.

use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use saga_realtime::supervisor::{Inbound, InboundHandler};
use saga_realtime::{ChannelHandle, ConnectionSupervisor, SubscriptionCache, Teardown};
use saga_types::events::{Change, ChangeEvent, Table};
use saga_types::models::{CampaignMessage, NewMessage};
use saga_types::store::BackingStore;
use saga_types::subscription::{Interest, RowFilter, SubscriptionDescriptor};

use crate::error::SyncError;
use crate::feed::Feed;
use crate::mirror::{Applied, Mirror};

pub const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Messages kept locally per campaign.
    pub limit: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

pub fn channel_name(campaign_id: Uuid) -> String {
    format!("campaign-history:{campaign_id}")
}

pub fn descriptor(campaign_id: Uuid) -> SubscriptionDescriptor {
    SubscriptionDescriptor::default()
        .with(Interest::all(Table::CampaignHistory).filtered(RowFilter::eq("campaign_id", campaign_id)))
}

/// Opens and memoizes per-campaign history mirrors.
#[derive(Clone)]
pub struct HistorySync {
    store: Arc<dyn BackingStore>,
    supervisor: ConnectionSupervisor,
    config: HistoryConfig,
    open: Arc<SubscriptionCache<Uuid, CampaignHistory>>,
}

impl HistorySync {
    pub fn new(store: Arc<dyn BackingStore>, supervisor: ConnectionSupervisor, config: HistoryConfig) -> Self {
        Self {
            store,
            supervisor,
            config,
            open: Arc::new(SubscriptionCache::new()),
        }
    }

    /// Subscribe to a campaign's history and load its most recent messages.
    /// A campaign that is already open is handed back as is.
    pub async fn open(&self, campaign_id: Uuid) -> Result<CampaignHistory, SyncError> {
        let acquired = self.open.acquire(campaign_id, || self.subscribe(campaign_id));
        let history = acquired.value;
        if acquired.reused {
            debug!("history for campaign {} already open", campaign_id);
            return Ok(history);
        }

        match history.feed.reload().await {
            Ok(count) => {
                info!("opened history for campaign {} ({} messages)", campaign_id, count);
                Ok(history)
            }
            Err(e) => {
                warn!("initial history fetch for campaign {} failed: {}", campaign_id, e);
                self.open.release(&campaign_id);
                Err(e.into())
            }
        }
    }

    pub fn get(&self, campaign_id: Uuid) -> Option<CampaignHistory> {
        self.open.get(&campaign_id)
    }

    pub fn close(&self, campaign_id: Uuid) -> bool {
        self.open.release(&campaign_id)
    }

    pub fn close_all(&self) {
        self.open.release_all();
    }

    /// Handler for history inserts carried on the user's multiplexed channel.
    /// Only campaigns that are open locally are affected.
    pub fn route(&self, event: &ChangeEvent) {
        let Some(campaign_id) = event.uuid("campaign_id") else {
            debug!("history change without a campaign id");
            return;
        };
        if let Some(history) = self.get(campaign_id) {
            history.feed.ingest(event);
        }
    }

    /// Re-fetch an open campaign after its turn state could not be trusted.
    pub fn reconcile(&self, campaign_id: Uuid) -> bool {
        match self.get(campaign_id) {
            Some(history) => history.feed.refetch_in_background(),
            None => false,
        }
    }

    fn subscribe(&self, campaign_id: Uuid) -> (CampaignHistory, Teardown) {
        let feed = {
            let store = self.store.clone();
            let limit = self.config.limit;
            Arc::new(Feed::new(
                format!("history {campaign_id}"),
                Mirror::capped(limit),
                Box::new(move || {
                    let store = store.clone();
                    async move { store.fetch_history(campaign_id, limit).await }.boxed()
                }),
            ))
        };

        let handler: InboundHandler = {
            let feed = feed.clone();
            Arc::new(move |inbound: Inbound| {
                if let Inbound::Change(event) = inbound {
                    feed.ingest(&event);
                }
            })
        };
        let channel = self
            .supervisor
            .supervise(channel_name(campaign_id), descriptor(campaign_id), handler);
        let teardown = channel.teardown();

        let history = CampaignHistory {
            campaign_id,
            feed,
            channel,
            store: self.store.clone(),
        };
        (history, teardown)
    }
}

/// Live, bounded view of one campaign's messages, ascending by id.
#[derive(Clone)]
pub struct CampaignHistory {
    campaign_id: Uuid,
    feed: Arc<Feed<CampaignMessage>>,
    channel: ChannelHandle,
    store: Arc<dyn BackingStore>,
}

impl std::fmt::Debug for CampaignHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CampaignHistory")
            .field("campaign_id", &self.campaign_id)
            .finish_non_exhaustive()
    }
}

impl CampaignHistory {
    pub fn campaign_id(&self) -> Uuid {
        self.campaign_id
    }

    pub fn messages(&self) -> Vec<CampaignMessage> {
        self.feed.rows()
    }

    pub fn latest_id(&self) -> Option<i64> {
        self.feed.rows().last().map(|message| message.id)
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<CampaignMessage>> {
        self.feed.subscribe()
    }

    pub fn channel(&self) -> &ChannelHandle {
        &self.channel
    }

    pub async fn refetch(&self) -> Result<usize, SyncError> {
        Ok(self.feed.reload().await?)
    }

    /// Write a message and show it right away. The store's change
    /// notification for the same row is deduplicated when it arrives.
    pub async fn send_message(&self, mut message: NewMessage) -> Result<CampaignMessage, SyncError> {
        message.campaign_id = self.campaign_id;
        let stored = self.store.insert_message(message).await?;
        if self.feed.apply(Change::Insert(stored.clone())) == Applied::Duplicate {
            debug!("message {} echoed before the write returned", stored.id);
        }
        Ok(stored)
    }
}
