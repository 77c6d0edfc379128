#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures_util::future::BoxFuture;
use uuid::Uuid;

use saga_realtime::memory::MemoryHub;
use saga_realtime::{ChannelRegistry, ConnectionSupervisor, SupervisorConfig};
use saga_types::events::{ChangeEvent, Table};
use saga_types::models::{
    ActionScope, CampaignMessage, CampaignSummary, CharacterLevel, MessageKind, NewMessage, PlayerAction, ReadStatus,
};
use saga_types::store::{BackingStore, StoreError, StoreResult};

/// Hosted store stand-in. Writes are published to the hub the way the
/// database's replication stream would publish them.
pub struct MemoryStore {
    hub: MemoryHub,
    state: Mutex<State>,
    failure: Mutex<Option<StoreError>>,
    pub fetches: AtomicUsize,
}

#[derive(Default)]
struct State {
    last_message_id: i64,
    messages: Vec<CampaignMessage>,
    read_status: Vec<ReadStatus>,
    actions: Vec<PlayerAction>,
    characters: Vec<CharacterLevel>,
    summaries: Vec<CampaignSummary>,
}

pub fn supervisor(hub: &MemoryHub) -> ConnectionSupervisor {
    ConnectionSupervisor::new(Arc::new(hub.clone()), ChannelRegistry::new(), SupervisorConfig::default())
}

pub fn narration(campaign_id: Uuid, content: &str) -> NewMessage {
    NewMessage {
        campaign_id,
        author_id: None,
        author_name: "Narrator".into(),
        kind: MessageKind::Narrator,
        content: content.into(),
        character_id: None,
    }
}

impl MemoryStore {
    pub fn new(hub: &MemoryHub) -> Arc<Self> {
        Arc::new(Self {
            hub: hub.clone(),
            state: Mutex::new(State::default()),
            failure: Mutex::new(None),
            fetches: AtomicUsize::new(0),
        })
    }

    /// The next store call fails with `error`.
    pub fn fail_next(&self, error: StoreError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Write a message as another client would, optionally without the
    /// change notification reaching anyone.
    pub fn write_message(&self, message: NewMessage, notify: bool) -> CampaignMessage {
        let stored = {
            let mut state = self.state.lock().unwrap();
            state.last_message_id += 1;
            let stored = CampaignMessage {
                id: state.last_message_id,
                campaign_id: message.campaign_id,
                author_id: message.author_id,
                author_name: message.author_name,
                kind: message.kind,
                content: message.content,
                character_id: message.character_id,
                created_at: Utc::now(),
            };
            state.messages.push(stored.clone());
            stored
        };
        if notify {
            self.hub
                .publish_change(ChangeEvent::insert(Table::CampaignHistory, &stored).unwrap());
        }
        stored
    }

    pub fn edit_message(&self, id: i64, content: &str) -> CampaignMessage {
        let edited = {
            let mut state = self.state.lock().unwrap();
            let message = state.messages.iter_mut().find(|m| m.id == id).unwrap();
            message.content = content.into();
            message.clone()
        };
        self.hub
            .publish_change(ChangeEvent::update(Table::CampaignHistory, &edited).unwrap());
        edited
    }

    pub fn add_action(&self, action: PlayerAction) {
        self.state.lock().unwrap().actions.push(action.clone());
        self.hub
            .publish_change(ChangeEvent::insert(Table::PlayerActions, &action).unwrap());
    }

    pub fn add_character(&self, character: CharacterLevel) {
        self.state.lock().unwrap().characters.push(character);
    }

    pub fn set_level(&self, character_id: Uuid, level: u32) -> CharacterLevel {
        let updated = {
            let mut state = self.state.lock().unwrap();
            let character = state
                .characters
                .iter_mut()
                .find(|c| c.character_id == character_id)
                .unwrap();
            character.level = level;
            character.updated_at = Utc::now();
            character.clone()
        };
        self.hub
            .publish_change(ChangeEvent::update(Table::Characters, &updated).unwrap());
        updated
    }

    pub fn put_summary(&self, summary: CampaignSummary, notify: bool) {
        let existed = {
            let mut state = self.state.lock().unwrap();
            let existed = state.summaries.iter().any(|s| s.campaign_id == summary.campaign_id);
            state.summaries.retain(|s| s.campaign_id != summary.campaign_id);
            state.summaries.push(summary.clone());
            existed
        };
        if notify {
            let event = if existed {
                ChangeEvent::update(Table::CampaignSummaries, &summary)
            } else {
                ChangeEvent::insert(Table::CampaignSummaries, &summary)
            };
            self.hub.publish_change(event.unwrap());
        }
    }

    fn check(&self) -> StoreResult<()> {
        match self.failure.lock().unwrap().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn fetched(&self) -> StoreResult<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.check()
    }
}

impl BackingStore for MemoryStore {
    fn ping(&self) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move { self.check() })
    }

    fn fetch_history(&self, campaign_id: Uuid, limit: usize) -> BoxFuture<'_, StoreResult<Vec<CampaignMessage>>> {
        Box::pin(async move {
            self.fetched()?;
            let state = self.state.lock().unwrap();
            let mut rows: Vec<_> = state
                .messages
                .iter()
                .filter(|m| m.campaign_id == campaign_id)
                .cloned()
                .collect();
            rows.sort_by_key(|m| m.id);
            let skip = rows.len().saturating_sub(limit);
            Ok(rows.split_off(skip))
        })
    }

    fn insert_message(&self, message: NewMessage) -> BoxFuture<'_, StoreResult<CampaignMessage>> {
        Box::pin(async move {
            self.check()?;
            Ok(self.write_message(message, true))
        })
    }

    fn fetch_read_status(&self, user_id: Uuid) -> BoxFuture<'_, StoreResult<Vec<ReadStatus>>> {
        Box::pin(async move {
            self.fetched()?;
            let state = self.state.lock().unwrap();
            Ok(state.read_status.iter().filter(|s| s.user_id == user_id).cloned().collect())
        })
    }

    fn upsert_read_status(&self, status: ReadStatus) -> BoxFuture<'_, StoreResult<ReadStatus>> {
        Box::pin(async move {
            self.check()?;
            let existed = {
                let mut state = self.state.lock().unwrap();
                let existed = state
                    .read_status
                    .iter()
                    .any(|s| s.user_id == status.user_id && s.campaign_id == status.campaign_id);
                state
                    .read_status
                    .retain(|s| !(s.user_id == status.user_id && s.campaign_id == status.campaign_id));
                state.read_status.push(status.clone());
                existed
            };
            let event = if existed {
                ChangeEvent::update(Table::ReadStatus, &status)
            } else {
                ChangeEvent::insert(Table::ReadStatus, &status)
            };
            self.hub.publish_change(event.unwrap());
            Ok(status)
        })
    }

    fn fetch_actions(&self, scope: ActionScope) -> BoxFuture<'_, StoreResult<Vec<PlayerAction>>> {
        Box::pin(async move {
            self.fetched()?;
            let state = self.state.lock().unwrap();
            Ok(state.actions.iter().filter(|a| a.scope() == scope).cloned().collect())
        })
    }

    fn delete_action(&self, action_id: Uuid) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            self.check()?;
            let removed = {
                let mut state = self.state.lock().unwrap();
                let at = state.actions.iter().position(|a| a.id == action_id);
                at.map(|at| state.actions.remove(at))
            };
            let removed = removed.ok_or(StoreError::NotFound)?;
            self.hub
                .publish_change(ChangeEvent::delete(Table::PlayerActions, &removed).unwrap());
            Ok(())
        })
    }

    fn fetch_characters(&self, user_id: Uuid) -> BoxFuture<'_, StoreResult<Vec<CharacterLevel>>> {
        Box::pin(async move {
            self.fetched()?;
            let state = self.state.lock().unwrap();
            Ok(state.characters.iter().filter(|c| c.user_id == user_id).cloned().collect())
        })
    }

    fn fetch_summaries(&self, _user_id: Uuid) -> BoxFuture<'_, StoreResult<Vec<CampaignSummary>>> {
        Box::pin(async move {
            self.fetched()?;
            Ok(self.state.lock().unwrap().summaries.clone())
        })
    }
}
