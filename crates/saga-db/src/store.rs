//! [`BackingStore`] over the local SQLite database.
//!
//! Every write is followed by a change notification handed to the optional
//! [`ChangeFeed`], standing in for the hosted store's replication stream.

use std::sync::Arc;

use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tracing::{error, warn};
use uuid::Uuid;

use saga_types::events::{ChangeEvent, Table};
use saga_types::models::{
    ActionScope, CampaignMessage, CampaignSummary, CharacterLevel, NewMessage, PlayerAction, ReadStatus,
};
use saga_types::store::{BackingStore, StoreError, StoreResult};

use crate::Database;
use crate::models::convert;

pub type ChangeFeed = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Database>,
    feed: Option<ChangeFeed>,
}

impl SqliteStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db, feed: None }
    }

    pub fn with_feed(mut self, feed: ChangeFeed) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    async fn blocking<T, F>(&self, op: &'static str, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                StoreError::Network(e.to_string())
            })?
            .map_err(|e| {
                warn!("{} failed: {:#}", op, e);
                StoreError::Rejected(format!("{:#}", e))
            })
    }

    fn publish(&self, event: serde_json::Result<ChangeEvent>) {
        let Some(feed) = &self.feed else {
            return;
        };
        match event {
            Ok(event) => feed(event),
            Err(e) => warn!("failed to encode change event: {}", e),
        }
    }

    // -- Writes made by the narrative engine and other clients --

    pub async fn create_campaign(&self, id: Uuid, title: &str) -> StoreResult<()> {
        let stored = title.to_string();
        self.blocking("create_campaign", move |db| db.create_campaign(id, &stored))
            .await?;
        self.publish(ChangeEvent::insert(
            Table::Campaigns,
            &serde_json::json!({ "id": id, "title": title }),
        ));
        Ok(())
    }

    /// Membership changes arrive on the campaigns table.
    pub async fn add_member(&self, campaign_id: Uuid, user_id: Uuid) -> StoreResult<()> {
        self.blocking("add_member", move |db| db.add_member(campaign_id, user_id))
            .await?;
        self.publish(ChangeEvent::update(
            Table::Campaigns,
            &serde_json::json!({ "id": campaign_id, "member_id": user_id }),
        ));
        Ok(())
    }

    pub async fn edit_message(&self, id: i64, content: &str) -> StoreResult<CampaignMessage> {
        let content = content.to_string();
        let row = self
            .blocking("edit_message", move |db| db.edit_message(id, &content))
            .await?
            .ok_or(StoreError::NotFound)?;
        let message = self.convert_one(row)?;
        self.publish(ChangeEvent::update(Table::CampaignHistory, &message));
        Ok(message)
    }

    pub async fn insert_action(&self, action: PlayerAction) -> StoreResult<()> {
        let stored = action.clone();
        self.blocking("insert_action", move |db| db.insert_action(&stored))
            .await?;
        self.publish(ChangeEvent::insert(Table::PlayerActions, &action));
        Ok(())
    }

    pub async fn upsert_character(&self, character: CharacterLevel) -> StoreResult<()> {
        let stored = character.clone();
        let existed = self
            .blocking("upsert_character", move |db| db.upsert_character(&stored))
            .await?;
        self.publish(upsert_event(Table::Characters, existed, &character));
        Ok(())
    }

    pub async fn upsert_summary(&self, summary: CampaignSummary) -> StoreResult<()> {
        let stored = summary.clone();
        let existed = self
            .blocking("upsert_summary", move |db| db.upsert_summary(&stored))
            .await?;
        self.publish(upsert_event(Table::CampaignSummaries, existed, &summary));
        Ok(())
    }

    fn convert_one<R, T>(&self, row: R) -> StoreResult<T>
    where
        T: TryFrom<R, Error = anyhow::Error>,
    {
        T::try_from(row).map_err(|e| {
            error!("malformed row: {:#}", e);
            StoreError::Rejected(format!("{:#}", e))
        })
    }

    fn convert_all<R, T>(&self, rows: Vec<R>) -> StoreResult<Vec<T>>
    where
        T: TryFrom<R, Error = anyhow::Error>,
    {
        convert(rows).map_err(|e| {
            error!("malformed row: {:#}", e);
            StoreError::Rejected(format!("{:#}", e))
        })
    }
}

fn upsert_event<T: serde::Serialize>(table: Table, existed: bool, row: &T) -> serde_json::Result<ChangeEvent> {
    if existed {
        ChangeEvent::update(table, row)
    } else {
        ChangeEvent::insert(table, row)
    }
}

impl BackingStore for SqliteStore {
    fn ping(&self) -> BoxFuture<'_, StoreResult<()>> {
        async move { self.blocking("ping", |db| db.ping()).await }.boxed()
    }

    fn fetch_history(&self, campaign_id: Uuid, limit: usize) -> BoxFuture<'_, StoreResult<Vec<CampaignMessage>>> {
        async move {
            let rows = self
                .blocking("fetch_history", move |db| db.get_history(campaign_id, limit))
                .await?;
            self.convert_all(rows)
        }
        .boxed()
    }

    fn insert_message(&self, message: NewMessage) -> BoxFuture<'_, StoreResult<CampaignMessage>> {
        async move {
            let row = self
                .blocking("insert_message", move |db| db.insert_message(&message, Utc::now()))
                .await?;
            let stored: CampaignMessage = self.convert_one(row)?;
            self.publish(ChangeEvent::insert(Table::CampaignHistory, &stored));
            Ok(stored)
        }
        .boxed()
    }

    fn fetch_read_status(&self, user_id: Uuid) -> BoxFuture<'_, StoreResult<Vec<ReadStatus>>> {
        async move {
            let rows = self
                .blocking("fetch_read_status", move |db| db.get_read_status(user_id))
                .await?;
            self.convert_all(rows)
        }
        .boxed()
    }

    fn upsert_read_status(&self, status: ReadStatus) -> BoxFuture<'_, StoreResult<ReadStatus>> {
        async move {
            let (row, existed) = self
                .blocking("upsert_read_status", move |db| db.upsert_read_status(&status))
                .await?;
            let stored: ReadStatus = self.convert_one(row)?;
            self.publish(upsert_event(Table::ReadStatus, existed, &stored));
            Ok(stored)
        }
        .boxed()
    }

    fn fetch_actions(&self, scope: ActionScope) -> BoxFuture<'_, StoreResult<Vec<PlayerAction>>> {
        async move {
            let rows = self
                .blocking("fetch_actions", move |db| db.get_actions(&scope))
                .await?;
            self.convert_all(rows)
        }
        .boxed()
    }

    fn delete_action(&self, action_id: Uuid) -> BoxFuture<'_, StoreResult<()>> {
        async move {
            let row = self
                .blocking("delete_action", move |db| db.delete_action(action_id))
                .await?
                .ok_or(StoreError::NotFound)?;
            let removed: PlayerAction = self.convert_one(row)?;
            self.publish(ChangeEvent::delete(Table::PlayerActions, &removed));
            Ok(())
        }
        .boxed()
    }

    fn fetch_characters(&self, user_id: Uuid) -> BoxFuture<'_, StoreResult<Vec<CharacterLevel>>> {
        async move {
            let rows = self
                .blocking("fetch_characters", move |db| db.get_characters(user_id))
                .await?;
            self.convert_all(rows)
        }
        .boxed()
    }

    fn fetch_summaries(&self, user_id: Uuid) -> BoxFuture<'_, StoreResult<Vec<CampaignSummary>>> {
        async move {
            let rows = self
                .blocking("fetch_summaries", move |db| db.get_summaries_for(user_id))
                .await?;
            self.convert_all(rows)
        }
        .boxed()
    }
}
