use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::{broadcast, watch};
use tracing::info;
use uuid::Uuid;

use saga_realtime::router::TableHandler;
use saga_types::events::ChangeEvent;
use saga_types::models::CharacterLevel;
use saga_types::store::BackingStore;

use crate::error::SyncError;
use crate::feed::Feed;
use crate::mirror::{Applied, Mirror};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelUp {
    pub character_id: Uuid,
    pub name: String,
    pub from: u32,
    pub to: u32,
}

/// The signed-in user's characters and their progression.
#[derive(Clone)]
pub struct LevelSync {
    feed: Arc<Feed<CharacterLevel>>,
    level_ups: broadcast::Sender<LevelUp>,
}

impl LevelSync {
    pub fn new(store: Arc<dyn BackingStore>, user_id: Uuid) -> Self {
        let loader = Box::new(move || {
            let store = store.clone();
            async move { store.fetch_characters(user_id).await }.boxed()
        });
        let (level_ups, _) = broadcast::channel(16);
        Self {
            feed: Arc::new(Feed::new(format!("characters {user_id}"), Mirror::new(), loader)),
            level_ups,
        }
    }

    pub async fn load(&self) -> Result<usize, SyncError> {
        Ok(self.feed.reload().await?)
    }

    pub fn handler(&self) -> TableHandler {
        let feed = self.feed.clone();
        let level_ups = self.level_ups.clone();
        Arc::new(move |event: &ChangeEvent| {
            let Some(character_id) = event.uuid("character_id") else {
                return;
            };
            let before = feed.get(&character_id);
            if feed.ingest(event) != Some(Applied::Updated) {
                return;
            }
            let (Some(before), Some(after)) = (before, feed.get(&character_id)) else {
                return;
            };
            if after.level > before.level {
                info!("{} reached level {}", after.name, after.level);
                let _ = level_ups.send(LevelUp {
                    character_id: after.character_id,
                    name: after.name,
                    from: before.level,
                    to: after.level,
                });
            }
        })
    }

    pub fn characters(&self) -> Vec<CharacterLevel> {
        self.feed.rows()
    }

    pub fn get(&self, character_id: Uuid) -> Option<CharacterLevel> {
        self.feed.get(&character_id)
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<CharacterLevel>> {
        self.feed.subscribe()
    }

    pub fn level_ups(&self) -> broadcast::Receiver<LevelUp> {
        self.level_ups.subscribe()
    }
}
