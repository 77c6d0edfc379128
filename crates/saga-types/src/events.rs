use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Store tables that produce change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Campaigns,
    CampaignHistory,
    Friendships,
    Invitations,
    ReadStatus,
    Characters,
    CampaignSummaries,
    PlayerActions,
}

impl Table {
    pub const ALL: [Table; 8] = [
        Table::Campaigns,
        Table::CampaignHistory,
        Table::Friendships,
        Table::Invitations,
        Table::ReadStatus,
        Table::Characters,
        Table::CampaignSummaries,
        Table::PlayerActions,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Table::Campaigns => "campaigns",
            Table::CampaignHistory => "campaign_history",
            Table::Friendships => "friendships",
            Table::Invitations => "invitations",
            Table::ReadStatus => "read_status",
            Table::Characters => "characters",
            Table::CampaignSummaries => "campaign_summaries",
            Table::PlayerActions => "player_actions",
        }
    }

    /// Returns `None` for tables this client has no model for.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|table| table.as_str() == name)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row-level change notification as delivered by the pub/sub transport.
///
/// `table` stays a plain string so notifications for tables this build does
/// not know about still deserialize and can be logged and dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    /// New row image. `Null` for deletes.
    #[serde(default)]
    pub record: Value,
    /// Previous row image. Carries the key for deletes.
    #[serde(default)]
    pub old_record: Value,
    pub commit_timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn insert<T: Serialize>(table: Table, row: &T) -> serde_json::Result<Self> {
        Ok(Self {
            table: table.as_str().to_string(),
            kind: ChangeKind::Insert,
            record: serde_json::to_value(row)?,
            old_record: Value::Null,
            commit_timestamp: Utc::now(),
        })
    }

    pub fn update<T: Serialize>(table: Table, row: &T) -> serde_json::Result<Self> {
        Ok(Self {
            kind: ChangeKind::Update,
            ..Self::insert(table, row)?
        })
    }

    pub fn delete<T: Serialize>(table: Table, old: &T) -> serde_json::Result<Self> {
        Ok(Self {
            table: table.as_str().to_string(),
            kind: ChangeKind::Delete,
            record: Value::Null,
            old_record: serde_json::to_value(old)?,
            commit_timestamp: Utc::now(),
        })
    }

    pub fn table(&self) -> Option<Table> {
        Table::parse(&self.table)
    }

    /// Looks a column up in the new row image, falling back to the old one.
    pub fn column(&self, name: &str) -> Option<&Value> {
        self.record
            .get(name)
            .or_else(|| self.old_record.get(name))
            .filter(|value| !value.is_null())
    }

    pub fn uuid(&self, name: &str) -> Option<Uuid> {
        self.column(name)
            .and_then(Value::as_str)
            .and_then(|value| Uuid::parse_str(value).ok())
    }

    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<Change<T>> {
        Ok(match self.kind {
            ChangeKind::Insert => Change::Insert(serde_json::from_value(self.record.clone())?),
            ChangeKind::Update => Change::Update(serde_json::from_value(self.record.clone())?),
            ChangeKind::Delete => Change::Delete(serde_json::from_value(self.old_record.clone())?),
        })
    }
}

/// Typed view of a [`ChangeEvent`].
#[derive(Debug, Clone, PartialEq)]
pub enum Change<T> {
    Insert(T),
    Update(T),
    Delete(T),
}

impl<T> Change<T> {
    pub fn row(&self) -> &T {
        match self {
            Change::Insert(row) | Change::Update(row) | Change::Delete(row) => row,
        }
    }
}

/// Ephemeral turn-coordination messages. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum TurnEvent {
    ActionStarted {
        player_id: Uuid,
        player_name: String,
        action: String,
    },
    ActionCompleted {
        player_id: Uuid,
        success: bool,
    },
}

impl TurnEvent {
    pub const STARTED: &'static str = "action-started";
    pub const COMPLETED: &'static str = "action-completed";

    pub fn name(&self) -> &'static str {
        match self {
            TurnEvent::ActionStarted { .. } => Self::STARTED,
            TurnEvent::ActionCompleted { .. } => Self::COMPLETED,
        }
    }

    pub fn player_id(&self) -> Uuid {
        match self {
            TurnEvent::ActionStarted { player_id, .. } | TurnEvent::ActionCompleted { player_id, .. } => {
                *player_id
            }
        }
    }

    /// Splits the event into the (event name, payload) pair a broadcast carries.
    pub fn into_broadcast(self) -> (&'static str, Value) {
        let name = self.name();
        let payload = match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => map.remove("payload").unwrap_or(Value::Null),
            _ => Value::Null,
        };
        (name, payload)
    }

    /// Parses a received broadcast. Unrelated broadcasts yield `None`.
    pub fn from_broadcast(event: &str, payload: &Value) -> Option<Self> {
        if event != Self::STARTED && event != Self::COMPLETED {
            return None;
        }
        let tagged = serde_json::json!({ "event": event, "payload": payload });
        serde_json::from_value(tagged).ok()
    }
}
