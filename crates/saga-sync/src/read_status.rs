use std::sync::Arc;

use chrono::Utc;
use futures_util::FutureExt;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use saga_realtime::router::TableHandler;
use saga_types::events::ChangeEvent;
use saga_types::models::ReadStatus;
use saga_types::store::BackingStore;

use crate::error::SyncError;
use crate::feed::Feed;
use crate::mirror::Mirror;

/// The signed-in user's last-read marker per campaign.
#[derive(Clone)]
pub struct ReadStatusSync {
    user_id: Uuid,
    store: Arc<dyn BackingStore>,
    feed: Arc<Feed<ReadStatus>>,
}

impl ReadStatusSync {
    pub fn new(store: Arc<dyn BackingStore>, user_id: Uuid) -> Self {
        let loader = {
            let store = store.clone();
            Box::new(move || {
                let store = store.clone();
                async move { store.fetch_read_status(user_id).await }.boxed()
            })
        };
        Self {
            user_id,
            store,
            feed: Arc::new(Feed::new(format!("read status {user_id}"), Mirror::new(), loader)),
        }
    }

    /// Initial fetch of every marker the user has.
    pub async fn load(&self) -> Result<usize, SyncError> {
        Ok(self.feed.reload().await?)
    }

    /// Router handler for `read_status` changes.
    pub fn handler(&self) -> TableHandler {
        let feed = self.feed.clone();
        Arc::new(move |event: &ChangeEvent| {
            feed.ingest(event);
        })
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn get(&self, campaign_id: Uuid) -> Option<ReadStatus> {
        self.feed.get(&campaign_id)
    }

    pub fn statuses(&self) -> Vec<ReadStatus> {
        self.feed.rows()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<ReadStatus>> {
        self.feed.subscribe()
    }

    /// A campaign the user never opened has no baseline and is not unread.
    pub fn is_unread(&self, campaign_id: Uuid, latest_message_id: i64) -> bool {
        self.get(campaign_id)
            .is_some_and(|status| latest_message_id > status.last_read_message_id)
    }

    /// Record that the user has seen `message_id`. Creates the marker on the
    /// first visit and only ever moves it forward.
    pub async fn mark_read(&self, campaign_id: Uuid, message_id: i64) -> Result<ReadStatus, SyncError> {
        if let Some(current) = self.get(campaign_id) {
            if current.last_read_message_id >= message_id {
                debug!(
                    "read marker for {} already at {}, not moving to {}",
                    campaign_id, current.last_read_message_id, message_id
                );
                return Ok(current);
            }
        }

        let stored = self
            .store
            .upsert_read_status(ReadStatus {
                user_id: self.user_id,
                campaign_id,
                last_read_message_id: message_id,
                updated_at: Utc::now(),
            })
            .await?;
        self.feed.upsert(stored.clone());
        Ok(stored)
    }
}
