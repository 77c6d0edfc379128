use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Player,
    Narrator,
    System,
}

/// One entry in a campaign's narrative log.
///
/// `id` is assigned by the store and strictly increases within a campaign.
/// It is the only ordering key: `created_at` can collide or arrive out of order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignMessage {
    pub id: i64,
    pub campaign_id: Uuid,
    pub author_id: Option<Uuid>,
    pub author_name: String,
    pub kind: MessageKind,
    pub content: String,
    pub character_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A message that has not been written to the store yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub campaign_id: Uuid,
    pub author_id: Option<Uuid>,
    pub author_name: String,
    pub kind: MessageKind,
    pub content: String,
    pub character_id: Option<Uuid>,
}

/// Last message a user has seen in a campaign. One row per (user, campaign).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadStatus {
    pub user_id: Uuid,
    pub campaign_id: Uuid,
    pub last_read_message_id: i64,
    pub updated_at: DateTime<Utc>,
}

/// Suggested action offered by the narrative engine to one character.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerAction {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub character_id: Uuid,
    pub game_mode: String,
    pub label: String,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl PlayerAction {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    pub fn scope(&self) -> ActionScope {
        ActionScope {
            campaign_id: self.campaign_id,
            character_id: self.character_id,
            game_mode: self.game_mode.clone(),
        }
    }
}

/// Player actions are always read for one (campaign, character, game mode).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionScope {
    pub campaign_id: Uuid,
    pub character_id: Uuid,
    pub game_mode: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterLevel {
    pub character_id: Uuid,
    pub user_id: Uuid,
    pub campaign_id: Option<Uuid>,
    pub name: String,
    pub level: u32,
    pub experience: u64,
    pub updated_at: DateTime<Utc>,
}

/// Per-campaign overview shown on the campaign list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignSummary {
    pub campaign_id: Uuid,
    pub title: String,
    pub summary: String,
    pub current_turn_player_id: Option<Uuid>,
    pub message_count: i64,
    pub updated_at: DateTime<Utc>,
}
