use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::watch;
use tracing::trace;
use uuid::Uuid;

use saga_realtime::router::TableHandler;
use saga_types::events::ChangeEvent;
use saga_types::models::CampaignSummary;
use saga_types::store::BackingStore;

use crate::error::SyncError;
use crate::feed::Feed;
use crate::mirror::Mirror;

/// Overview of every campaign the user belongs to, most recently active first.
#[derive(Clone)]
pub struct SummarySync {
    feed: Arc<Feed<CampaignSummary>>,
}

impl SummarySync {
    pub fn new(store: Arc<dyn BackingStore>, user_id: Uuid) -> Self {
        let loader = Box::new(move || {
            let store = store.clone();
            async move { store.fetch_summaries(user_id).await }.boxed()
        });
        Self {
            feed: Arc::new(Feed::new(format!("summaries {user_id}"), Mirror::new(), loader)),
        }
    }

    pub async fn load(&self) -> Result<usize, SyncError> {
        Ok(self.feed.reload().await?)
    }

    /// Summary changes arrive for every campaign. Only campaigns already in
    /// the mirror are applied; new memberships come in through [`refresh`].
    ///
    /// [`refresh`]: SummarySync::refresh
    pub fn handler(&self) -> TableHandler {
        let feed = self.feed.clone();
        Arc::new(move |event: &ChangeEvent| {
            let known = event
                .uuid("campaign_id")
                .is_some_and(|campaign_id| feed.get(&campaign_id).is_some());
            if known {
                feed.ingest(event);
            } else {
                trace!("ignoring summary change for a campaign the user is not in");
            }
        })
    }

    /// Campaign membership changed; re-read the whole list.
    pub fn refresh(&self) -> bool {
        self.feed.refetch_in_background()
    }

    pub fn summaries(&self) -> Vec<CampaignSummary> {
        self.feed.rows()
    }

    pub fn get(&self, campaign_id: Uuid) -> Option<CampaignSummary> {
        self.feed.get(&campaign_id)
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<CampaignSummary>> {
        self.feed.subscribe()
    }
}
