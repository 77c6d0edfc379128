//! Database row types. These map directly to SQLite rows and stay separate
//! from the saga-types models so the storage layout can change on its own.

use anyhow::{Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use saga_types::models::{CampaignMessage, CampaignSummary, CharacterLevel, MessageKind, PlayerAction, ReadStatus};

pub struct MessageRow {
    pub id: i64,
    pub campaign_id: String,
    pub author_id: Option<String>,
    pub author_name: String,
    pub kind: String,
    pub content: String,
    pub character_id: Option<String>,
    pub created_at: String,
}

pub struct ReadStatusRow {
    pub user_id: String,
    pub campaign_id: String,
    pub last_read_message_id: i64,
    pub updated_at: String,
}

pub struct ActionRow {
    pub id: String,
    pub campaign_id: String,
    pub character_id: String,
    pub game_mode: String,
    pub label: String,
    pub priority: i32,
    pub created_at: String,
    pub expires_at: Option<String>,
}

pub struct CharacterRow {
    pub id: String,
    pub user_id: String,
    pub campaign_id: Option<String>,
    pub name: String,
    pub level: i64,
    pub experience: i64,
    pub updated_at: String,
}

pub struct SummaryRow {
    pub campaign_id: String,
    pub title: String,
    pub summary: String,
    pub current_turn_player_id: Option<String>,
    pub message_count: i64,
    pub updated_at: String,
}

/// Fixed width so stored timestamps sort as text.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| anyhow!("bad uuid {:?}: {}", value, e))
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .map_err(|e| anyhow!("bad timestamp {:?}: {}", value, e))?
        .with_timezone(&Utc))
}

pub fn kind_str(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Player => "player",
        MessageKind::Narrator => "narrator",
        MessageKind::System => "system",
    }
}

fn parse_kind(value: &str) -> Result<MessageKind> {
    match value {
        "player" => Ok(MessageKind::Player),
        "narrator" => Ok(MessageKind::Narrator),
        "system" => Ok(MessageKind::System),
        other => Err(anyhow!("unknown message kind: {}", other)),
    }
}

impl TryFrom<MessageRow> for CampaignMessage {
    type Error = anyhow::Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            campaign_id: parse_uuid(&row.campaign_id)?,
            author_id: row.author_id.as_deref().map(parse_uuid).transpose()?,
            author_name: row.author_name,
            kind: parse_kind(&row.kind)?,
            content: row.content,
            character_id: row.character_id.as_deref().map(parse_uuid).transpose()?,
            created_at: parse_time(&row.created_at)?,
        })
    }
}

impl TryFrom<ReadStatusRow> for ReadStatus {
    type Error = anyhow::Error;

    fn try_from(row: ReadStatusRow) -> Result<Self> {
        Ok(Self {
            user_id: parse_uuid(&row.user_id)?,
            campaign_id: parse_uuid(&row.campaign_id)?,
            last_read_message_id: row.last_read_message_id,
            updated_at: parse_time(&row.updated_at)?,
        })
    }
}

impl TryFrom<ActionRow> for PlayerAction {
    type Error = anyhow::Error;

    fn try_from(row: ActionRow) -> Result<Self> {
        Ok(Self {
            id: parse_uuid(&row.id)?,
            campaign_id: parse_uuid(&row.campaign_id)?,
            character_id: parse_uuid(&row.character_id)?,
            game_mode: row.game_mode,
            label: row.label,
            priority: row.priority,
            created_at: parse_time(&row.created_at)?,
            expires_at: row.expires_at.as_deref().map(parse_time).transpose()?,
        })
    }
}

impl TryFrom<CharacterRow> for CharacterLevel {
    type Error = anyhow::Error;

    fn try_from(row: CharacterRow) -> Result<Self> {
        Ok(Self {
            character_id: parse_uuid(&row.id)?,
            user_id: parse_uuid(&row.user_id)?,
            campaign_id: row.campaign_id.as_deref().map(parse_uuid).transpose()?,
            name: row.name,
            level: u32::try_from(row.level)?,
            experience: u64::try_from(row.experience)?,
            updated_at: parse_time(&row.updated_at)?,
        })
    }
}

impl TryFrom<SummaryRow> for CampaignSummary {
    type Error = anyhow::Error;

    fn try_from(row: SummaryRow) -> Result<Self> {
        Ok(Self {
            campaign_id: parse_uuid(&row.campaign_id)?,
            title: row.title,
            summary: row.summary,
            current_turn_player_id: row.current_turn_player_id.as_deref().map(parse_uuid).transpose()?,
            message_count: row.message_count,
            updated_at: parse_time(&row.updated_at)?,
        })
    }
}

/// Converts a batch of rows, failing on the first malformed one.
pub fn convert<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = anyhow::Error>,
{
    rows.into_iter().map(T::try_from).collect()
}
